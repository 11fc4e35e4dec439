//! Controller knobs. Defaults, overridable from `TETHER_*` environment variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Re-check interval for healthy items, independent of backoff.
    pub poll_interval: Duration,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Concurrent reconcile passes across all keys.
    pub workers: usize,
    /// Deadline for one reconcile pass.
    pub pass_timeout: Duration,
    /// Attempts for a status write that keeps hitting conflicts.
    pub status_retries: usize,
    /// Restrict watches to one namespace.
    pub namespace: Option<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(60),
            workers: 4,
            pass_timeout: Duration::from_secs(30),
            status_retries: 5,
            namespace: None,
        }
    }
}

fn env_u64(name: &str) -> Option<u64> { std::env::var(name).ok().and_then(|s| s.parse::<u64>().ok()) }

/// Intervals and deadlines of zero are meaningless; fall back to the default.
fn env_nonzero(name: &str) -> Option<u64> { env_u64(name).filter(|n| *n > 0) }

impl ControllerConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            poll_interval: env_nonzero("TETHER_POLL_SECS").map(Duration::from_secs).unwrap_or(d.poll_interval),
            base_delay: env_u64("TETHER_BASE_DELAY_MS").map(Duration::from_millis).unwrap_or(d.base_delay),
            max_delay: env_nonzero("TETHER_MAX_DELAY_SECS").map(Duration::from_secs).unwrap_or(d.max_delay),
            workers: env_u64("TETHER_WORKERS").map(|n| n.max(1) as usize).unwrap_or(d.workers),
            pass_timeout: env_nonzero("TETHER_PASS_TIMEOUT_SECS").map(Duration::from_secs).unwrap_or(d.pass_timeout),
            status_retries: env_u64("TETHER_STATUS_RETRIES").map(|n| n.max(1) as usize).unwrap_or(d.status_retries),
            namespace: std::env::var("TETHER_NAMESPACE").ok().filter(|s| !s.is_empty()),
        }
    }
}
