//! Engine tuning knobs.

use serde::{Deserialize, Serialize};

/// Configuration for one tenant engine instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Command channel capacity. Producers back-pressure once this many
    /// envelopes are queued.
    pub channel_capacity: usize,

    /// Write-behind retry attempts per change record.
    pub persist_retries: u32,

    /// Base backoff between write-behind retries, in milliseconds. The
    /// delay doubles on each attempt.
    pub persist_backoff_ms: u64,

    /// Persistence failure rate that flips the health flag to degraded.
    pub degraded_threshold: f64,

    /// Width of the sliding window used for the failure rate, in seconds.
    pub degraded_window_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 10_000,
            persist_retries: 3,
            persist_backoff_ms: 1_000,
            degraded_threshold: 0.1,
            degraded_window_secs: 60,
        }
    }
}
