// Engine configuration
// Every tunable of the sync engine lives here; nothing in the engine hardcodes them

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Configuration for the gossip synchronization engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Minimum (and initial) scheduler tick interval in milliseconds
    pub tick_floor_ms: u64,
    /// Transport occupancy ratio at which flushing stops and the tick backs off
    pub congestion_threshold: f64,
    /// Publishes are rejected once the local queue holds this many items
    pub publish_queue_cap: usize,
    /// Internal offers beyond this many queued items are dropped
    pub queue_hard_limit: usize,
    /// Maximum assertions per gossip batch
    pub batch_size: usize,
    /// Assertions older than this are neither kept nor relayed
    pub staleness_window_secs: u64,
    /// Gossip is republished at least this often even without changes
    pub republish_interval_secs: u64,
    /// Maximum back-links followed from one polled channel head
    pub max_batch_chain: usize,
    /// Salt of the mutable DHT slot carrying a node's gossip head
    pub gossip_salt: Vec<u8>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_floor_ms: 50,
            congestion_threshold: 0.8,
            publish_queue_cap: 100,
            queue_hard_limit: 1000,
            batch_size: 50,
            staleness_window_secs: 24 * 60 * 60,
            republish_interval_secs: 30,
            max_batch_chain: 8,
            gossip_salt: b"dhtchat/gossip".to_vec(),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tick_floor_ms(mut self, ms: u64) -> Self {
        self.tick_floor_ms = ms;
        self
    }

    pub fn with_congestion_threshold(mut self, threshold: f64) -> Self {
        self.congestion_threshold = threshold;
        self
    }

    pub fn with_publish_queue_cap(mut self, cap: usize) -> Self {
        self.publish_queue_cap = cap;
        self
    }

    pub fn with_queue_hard_limit(mut self, limit: usize) -> Self {
        self.queue_hard_limit = limit;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_staleness_window_secs(mut self, secs: u64) -> Self {
        self.staleness_window_secs = secs;
        self
    }

    pub fn with_republish_interval_secs(mut self, secs: u64) -> Self {
        self.republish_interval_secs = secs;
        self
    }

    pub fn with_max_batch_chain(mut self, hops: usize) -> Self {
        self.max_batch_chain = hops;
        self
    }

    pub fn with_gossip_salt(mut self, salt: &[u8]) -> Self {
        self.gossip_salt = salt.to_vec();
        self
    }

    pub fn tick_floor(&self) -> Duration {
        Duration::from_millis(self.tick_floor_ms)
    }

    pub fn staleness_window_ms(&self) -> u64 {
        self.staleness_window_secs.saturating_mul(1000)
    }

    pub fn republish_interval_ms(&self) -> u64 {
        self.republish_interval_secs.saturating_mul(1000)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_floor_ms == 0 {
            return Err(ConfigError::Invalid("tick_floor_ms cannot be 0".to_string()));
        }
        if !(self.congestion_threshold > 0.0 && self.congestion_threshold <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "congestion_threshold must be in (0, 1], got {}",
                self.congestion_threshold
            )));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size cannot be 0".to_string()));
        }
        if self.queue_hard_limit < self.publish_queue_cap {
            return Err(ConfigError::Invalid(
                "queue_hard_limit must be at least publish_queue_cap".to_string(),
            ));
        }
        if self.gossip_salt.is_empty() {
            return Err(ConfigError::Invalid("gossip_salt cannot be empty".to_string()));
        }
        Ok(())
    }
}
