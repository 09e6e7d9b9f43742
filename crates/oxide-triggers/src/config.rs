//! Trigger engine configuration.

use serde::{Deserialize, Serialize};

/// Configuration for trigger resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerEngineConfig {
    /// Maximum number of virtual jobs a single completion may propagate
    /// through before the chain is treated as a cycle.
    #[serde(default = "default_max_virtual_depth")]
    pub max_virtual_depth: usize,
    /// How many open events to inspect when looking for a destination event
    /// to reuse.
    #[serde(default = "default_event_lookup_limit")]
    pub event_lookup_limit: u32,
    /// Reopen a fired join when its build could not be created, so that a
    /// redelivered completion can retry it.
    #[serde(default = "default_release_claim_on_failure")]
    pub release_claim_on_failure: bool,
}

fn default_max_virtual_depth() -> usize {
    64
}

fn default_event_lookup_limit() -> u32 {
    50
}

fn default_release_claim_on_failure() -> bool {
    true
}

impl Default for TriggerEngineConfig {
    fn default() -> Self {
        Self {
            max_virtual_depth: default_max_virtual_depth(),
            event_lookup_limit: default_event_lookup_limit(),
            release_claim_on_failure: default_release_claim_on_failure(),
        }
    }
}

impl TriggerEngineConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &std::path::Path) -> Result<Self, std::io::Error> {
        let contents = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&contents)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Set the virtual propagation depth limit.
    pub fn with_max_virtual_depth(mut self, depth: usize) -> Self {
        self.max_virtual_depth = depth;
        self
    }

    /// Set how many open events are inspected for reuse.
    pub fn with_event_lookup_limit(mut self, limit: u32) -> Self {
        self.event_lookup_limit = limit;
        self
    }

    /// Enable or disable reopening joins after a failed build creation.
    pub fn with_release_claim_on_failure(mut self, enable: bool) -> Self {
        self.release_claim_on_failure = enable;
        self
    }
}
