use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Session directory configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryConfig {
    /// Delay before a recipient's queued messages are flushed
    #[serde(default = "default_flush_delay_ms")]
    pub flush_delay_ms: u64,

    /// Wait before re-checking an invite acceptance another task is running
    #[serde(default = "default_in_flight_recheck_ms")]
    pub in_flight_recheck_ms: u64,

    /// Age after which stale devices and peers are pruned
    #[serde(default = "default_max_stale_latency_ms")]
    pub max_stale_latency_ms: u64,

    /// Sent events kept per recipient for replay to newly discovered devices
    #[serde(default = "default_message_history_limit")]
    pub message_history_limit: usize,
}

fn default_flush_delay_ms() -> u64 {
    1000
}

fn default_in_flight_recheck_ms() -> u64 {
    250
}

fn default_max_stale_latency_ms() -> u64 {
    7 * 24 * 60 * 60 * 1000
}

fn default_message_history_limit() -> usize {
    100
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            flush_delay_ms: default_flush_delay_ms(),
            in_flight_recheck_ms: default_in_flight_recheck_ms(),
            max_stale_latency_ms: default_max_stale_latency_ms(),
            message_history_limit: default_message_history_limit(),
        }
    }
}

impl DirectoryConfig {
    /// Load config from a JSON file, falling back to defaults if it is missing
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Storage(format!("Failed to read config file: {}", e)))?;
        serde_json::from_str(&content)
            .map_err(|e| Error::Serialization(format!("Failed to parse config file: {}", e)))
    }

    pub fn flush_delay(&self) -> Duration {
        Duration::from_millis(self.flush_delay_ms)
    }

    pub fn in_flight_recheck(&self) -> Duration {
        Duration::from_millis(self.in_flight_recheck_ms)
    }
}
