//! Repository implementations for PostgreSQL.

mod join_state;

pub use join_state::PgJoinStateStore;
