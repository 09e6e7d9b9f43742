//! Oxide CI Core
//!
//! Core domain types, traits, and error handling for the Oxide CI trigger
//! engine. This crate has minimal dependencies and defines the shared
//! vocabulary used across all other crates.

pub mod build;
pub mod error;
pub mod event;
pub mod ids;
pub mod join;
pub mod pipeline;
pub mod ports;
pub mod workflow;

pub use error::{Error, Result};
pub use ids::*;
