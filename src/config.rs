/*!
 * Socket Layer Configuration
 *
 * Table sizing and observability knobs, with presets and env overrides.
 */

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::core::limits::{
    COMPACT_OPEN_FDS, DEFAULT_SLOW_CALL_MS, MAX_OPEN_FDS, MAX_OPEN_FDS_LIMIT, TESTING_OPEN_FDS,
};

/// Environment variable overriding the handle table capacity
pub const ENV_MAX_FDS: &str = "SOCKBRIDGE_MAX_FDS";

/// Environment variable overriding the slow-call threshold (milliseconds)
pub const ENV_SLOW_CALL_MS: &str = "SOCKBRIDGE_SLOW_CALL_MS";

/// Configuration for a [`SocketLayer`](crate::syscalls::SocketLayer)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Handle table capacity (default: 4096)
    pub max_open_fds: usize,

    /// Bridged calls slower than this are logged at warn level (default: 10ms)
    pub slow_call_threshold_ms: u64,
}

impl BridgeConfig {
    /// Create default configuration
    pub fn new() -> Self {
        Self {
            max_open_fds: MAX_OPEN_FDS,
            slow_call_threshold_ms: DEFAULT_SLOW_CALL_MS,
        }
    }

    /// Smaller table for constrained sandboxes
    pub fn compact() -> Self {
        Self {
            max_open_fds: COMPACT_OPEN_FDS,
            ..Self::new()
        }
    }

    /// Tiny table so exhaustion paths are cheap to reach (testing only)
    pub fn testing() -> Self {
        Self {
            max_open_fds: TESTING_OPEN_FDS,
            slow_call_threshold_ms: 1000,
        }
    }

    /// Override the table capacity
    pub fn with_max_open_fds(mut self, max_open_fds: usize) -> Self {
        self.max_open_fds = clamp_capacity(max_open_fds);
        self
    }

    /// Defaults overridden by `SOCKBRIDGE_MAX_FDS` / `SOCKBRIDGE_SLOW_CALL_MS`
    ///
    /// Unparseable values are ignored with a warning.
    pub fn from_env() -> Self {
        let mut config = Self::new();

        if let Ok(raw) = std::env::var(ENV_MAX_FDS) {
            match raw.trim().parse::<usize>() {
                Ok(n) => config.max_open_fds = clamp_capacity(n),
                Err(e) => log::warn!("Ignoring {}={:?}: {}", ENV_MAX_FDS, raw, e),
            }
        }

        if let Ok(raw) = std::env::var(ENV_SLOW_CALL_MS) {
            match raw.trim().parse::<u64>() {
                Ok(ms) => config.slow_call_threshold_ms = ms,
                Err(e) => log::warn!("Ignoring {}={:?}: {}", ENV_SLOW_CALL_MS, raw, e),
            }
        }

        config
    }

    #[inline]
    pub fn slow_call_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_call_threshold_ms)
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn clamp_capacity(n: usize) -> usize {
    n.clamp(1, MAX_OPEN_FDS_LIMIT)
}
