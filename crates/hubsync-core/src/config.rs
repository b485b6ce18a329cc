//! Engine configuration - worker count and retry backoff
//!
//! The worker count bounds how many handlers run at once, and with it the
//! storage write concurrency. Handlers block on storage I/O, so the upper
//! bound is a multiple of the logical CPU count.
//!
//! Configuration can be built in code or loaded from RON:
//!
//! ```
//! use hubsync_core::EngineConfig;
//!
//! let config = EngineConfig::from_ron_str(
//!     "(worker_count: 2, retry_base_delay_ms: 10, retry_max_delay_ms: 1000)",
//! )
//! .unwrap();
//! assert_eq!(config.worker_count(), 2.min(hubsync_core::max_workers()));
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Workers allowed per logical CPU
pub const WORKERS_PER_CPU: usize = 4;

const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 50;
const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 5_000;

/// Configuration for the conflation manager and its worker pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of worker threads, clamped to `[1, max_workers()]`
    worker_count: usize,
    /// First retry delay after a transient handler failure
    retry_base_delay_ms: u64,
    /// Upper bound for the retry delay
    retry_max_delay_ms: u64,
}

impl EngineConfig {
    /// Create a configuration with the given worker count and default backoff
    ///
    /// The worker count is clamped to `[1, max_workers()]`.
    pub fn with_worker_count(worker_count: usize) -> Self {
        Self {
            worker_count: worker_count.clamp(1, max_workers()),
            ..Self::default()
        }
    }

    /// Parse a configuration from RON text
    pub fn from_ron_str(text: &str) -> Result<Self> {
        let config: EngineConfig = ron::from_str(text)?;
        config.validated()
    }

    /// Load a configuration from a RON file
    pub fn from_ron_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_ron_str(&content)
    }

    /// Clamp the worker count and check the backoff bounds
    fn validated(mut self) -> Result<Self> {
        self.worker_count = self.worker_count.clamp(1, max_workers());
        if self.retry_base_delay_ms > self.retry_max_delay_ms {
            return Err(Error::InvalidConfig(format!(
                "retry_base_delay_ms ({}) exceeds retry_max_delay_ms ({})",
                self.retry_base_delay_ms, self.retry_max_delay_ms
            )));
        }
        Ok(self)
    }

    /// Number of worker threads
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Set the number of worker threads, clamped to `[1, max_workers()]`
    pub fn set_worker_count(&mut self, n: usize) {
        self.worker_count = n.clamp(1, max_workers());
    }

    /// Set the retry backoff bounds
    ///
    /// `max` is raised to `base` if it is smaller.
    pub fn set_retry_delays(&mut self, base: Duration, max: Duration) {
        self.retry_base_delay_ms = duration_ms(base);
        self.retry_max_delay_ms = duration_ms(max).max(self.retry_base_delay_ms);
    }

    /// First retry delay
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    /// Maximum retry delay
    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }

    /// Delay before retry number `attempt` (1-based)
    ///
    /// Doubles from the base delay and saturates at the maximum.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(32);
        let delay = self
            .retry_base_delay_ms
            .saturating_mul(1u64 << shift)
            .min(self.retry_max_delay_ms);
        Duration::from_millis(delay)
    }
}

impl Default for EngineConfig {
    /// One worker per logical CPU
    fn default() -> Self {
        Self {
            worker_count: num_cpus::get().max(1),
            retry_base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            retry_max_delay_ms: DEFAULT_RETRY_MAX_DELAY_MS,
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Upper bound for the worker count on this system
///
/// Uses the `num_cpus` crate to detect the number of logical CPUs.
pub fn max_workers() -> usize {
    num_cpus::get().max(1) * WORKERS_PER_CPU
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_uses_cpu_count() {
        let config = EngineConfig::default();
        assert_eq!(config.worker_count(), num_cpus::get().max(1));
        assert_eq!(config.retry_base_delay(), Duration::from_millis(50));
    }

    #[test]
    fn test_worker_count_clamped() {
        assert_eq!(EngineConfig::with_worker_count(0).worker_count(), 1);
        assert_eq!(
            EngineConfig::with_worker_count(100_000).worker_count(),
            max_workers()
        );

        let mut config = EngineConfig::with_worker_count(1);
        config.set_worker_count(2);
        assert_eq!(config.worker_count(), 2.min(max_workers()));
    }

    #[test]
    fn test_retry_delay_doubles_and_saturates() {
        let mut config = EngineConfig::default();
        config.set_retry_delays(Duration::from_millis(10), Duration::from_millis(50));
        assert_eq!(config.retry_delay(1), Duration::from_millis(10));
        assert_eq!(config.retry_delay(2), Duration::from_millis(20));
        assert_eq!(config.retry_delay(3), Duration::from_millis(40));
        assert_eq!(config.retry_delay(4), Duration::from_millis(50));
        assert_eq!(config.retry_delay(60), Duration::from_millis(50));
    }

    #[test]
    fn test_set_retry_delays_keeps_max_above_base() {
        let mut config = EngineConfig::default();
        config.set_retry_delays(Duration::from_millis(100), Duration::from_millis(10));
        assert_eq!(config.retry_max_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_from_ron_partial() {
        let config = EngineConfig::from_ron_str("(worker_count: 1)").unwrap();
        assert_eq!(config.worker_count(), 1);
        assert_eq!(config.retry_max_delay(), Duration::from_millis(5_000));
    }

    #[test]
    fn test_from_ron_rejects_inverted_backoff() {
        let err = EngineConfig::from_ron_str("(retry_base_delay_ms: 10, retry_max_delay_ms: 5)")
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_from_ron_syntax_error() {
        assert!(matches!(
            EngineConfig::from_ron_str("(worker_count: )"),
            Err(Error::Config(_))
        ));
    }
}
