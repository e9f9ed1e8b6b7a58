//! Rebuild engine configuration
//!
//! Configuration loaded from environment variables and command line.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Discard boundary used by the Reclaim pass after a successful operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReclaimBoundary {
    /// Discard records up to the operation's stable epoch
    #[default]
    StableEpoch,
    /// Discard every record of objects no longer needed locally
    Unbounded,
}

impl std::str::FromStr for ReclaimBoundary {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stable" | "stable-epoch" => Ok(Self::StableEpoch),
            "unbounded" => Ok(Self::Unbounded),
            other => Err(ConfigError::InvalidValue(
                "TESSEL_REBUILD_RECLAIM_BOUNDARY".to_string(),
                other.to_string(),
            )),
        }
    }
}

/// Rebuild engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebuildConfig {
    /// Maximum pools with a running control loop
    pub max_running_pools: usize,

    /// Leader progress poll interval in milliseconds
    pub poll_interval_ms: u64,

    /// Minimum gap between progress log lines in milliseconds
    pub progress_log_interval_ms: u64,

    /// Follower status report interval in milliseconds
    pub report_interval_ms: u64,

    /// Poll interval while waiting for map acknowledgement in milliseconds
    pub map_sync_poll_ms: u64,

    /// Scheduler sleep when nothing can be launched in milliseconds
    pub scheduler_idle_ms: u64,

    /// Objects scanned between cooperative yields
    pub scan_yield_budget: usize,

    /// Entries per object-list request
    pub object_list_batch: usize,

    /// Attempts per object-list request on try-again
    pub object_list_retries: u32,

    /// Transfer units smaller than this are carried inline
    pub inline_threshold: usize,

    /// Cap on remembered already-migrated records per tracker
    pub migrated_record_cap: usize,

    /// Puller tasks per target tracker
    pub pullers_per_tracker: usize,

    /// Puller idle wait when the queue is empty in milliseconds
    pub puller_idle_ms: u64,

    /// Base retry delay in milliseconds (jittered)
    pub retry_delay_ms: u64,

    /// Attempts per discard on busy objects
    pub discard_retries: u32,

    /// Delay between discard attempts in milliseconds
    pub discard_retry_delay_ms: u64,

    /// Reclaim discard boundary
    pub reclaim_boundary: ReclaimBoundary,
}

impl Default for RebuildConfig {
    fn default() -> Self {
        Self {
            max_running_pools: 4,
            poll_interval_ms: 200,
            progress_log_interval_ms: 2_000,
            report_interval_ms: 100,
            map_sync_poll_ms: 50,
            scheduler_idle_ms: 50,
            scan_yield_budget: 64,
            object_list_batch: 128,
            object_list_retries: 5,
            inline_threshold: 32 * 1024,
            migrated_record_cap: 10_000,
            pullers_per_tracker: 2,
            puller_idle_ms: 20,
            retry_delay_ms: 500,
            discard_retries: 10,
            discard_retry_delay_ms: 10,
            reclaim_boundary: ReclaimBoundary::StableEpoch,
        }
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .map_err(|_| ConfigError::InvalidValue(name.to_string(), value)),
        Err(_) => Ok(default),
    }
}

impl RebuildConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let d = Self::default();

        let config = Self {
            max_running_pools: env_or("TESSEL_REBUILD_MAX_RUNNING_POOLS", d.max_running_pools)?,
            poll_interval_ms: env_or("TESSEL_REBUILD_POLL_INTERVAL_MS", d.poll_interval_ms)?,
            progress_log_interval_ms: env_or(
                "TESSEL_REBUILD_PROGRESS_LOG_INTERVAL_MS",
                d.progress_log_interval_ms,
            )?,
            report_interval_ms: env_or("TESSEL_REBUILD_REPORT_INTERVAL_MS", d.report_interval_ms)?,
            map_sync_poll_ms: env_or("TESSEL_REBUILD_MAP_SYNC_POLL_MS", d.map_sync_poll_ms)?,
            scheduler_idle_ms: env_or("TESSEL_REBUILD_SCHEDULER_IDLE_MS", d.scheduler_idle_ms)?,
            scan_yield_budget: env_or("TESSEL_REBUILD_SCAN_YIELD_BUDGET", d.scan_yield_budget)?,
            object_list_batch: env_or("TESSEL_REBUILD_OBJECT_LIST_BATCH", d.object_list_batch)?,
            object_list_retries: env_or(
                "TESSEL_REBUILD_OBJECT_LIST_RETRIES",
                d.object_list_retries,
            )?,
            inline_threshold: env_or("TESSEL_REBUILD_INLINE_THRESHOLD", d.inline_threshold)?,
            migrated_record_cap: env_or(
                "TESSEL_REBUILD_MIGRATED_RECORD_CAP",
                d.migrated_record_cap,
            )?,
            pullers_per_tracker: env_or(
                "TESSEL_REBUILD_PULLERS_PER_TRACKER",
                d.pullers_per_tracker,
            )?,
            puller_idle_ms: env_or("TESSEL_REBUILD_PULLER_IDLE_MS", d.puller_idle_ms)?,
            retry_delay_ms: env_or("TESSEL_REBUILD_RETRY_DELAY_MS", d.retry_delay_ms)?,
            discard_retries: env_or("TESSEL_REBUILD_DISCARD_RETRIES", d.discard_retries)?,
            discard_retry_delay_ms: env_or(
                "TESSEL_REBUILD_DISCARD_RETRY_DELAY_MS",
                d.discard_retry_delay_ms,
            )?,
            reclaim_boundary: env_or("TESSEL_REBUILD_RECLAIM_BOUNDARY", d.reclaim_boundary)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would stall the engine
    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("TESSEL_REBUILD_MAX_RUNNING_POOLS", self.max_running_pools),
            ("TESSEL_REBUILD_SCAN_YIELD_BUDGET", self.scan_yield_budget),
            ("TESSEL_REBUILD_OBJECT_LIST_BATCH", self.object_list_batch),
            ("TESSEL_REBUILD_PULLERS_PER_TRACKER", self.pullers_per_tracker),
            ("TESSEL_REBUILD_MIGRATED_RECORD_CAP", self.migrated_record_cap),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(ConfigError::InvalidValue(name.to_string(), "0".to_string()));
            }
        }
        Ok(())
    }

    /// Settings for tests and the simulator: short intervals everywhere
    pub fn fast() -> Self {
        Self {
            poll_interval_ms: 10,
            progress_log_interval_ms: 100,
            report_interval_ms: 5,
            map_sync_poll_ms: 5,
            scheduler_idle_ms: 5,
            scan_yield_budget: 8,
            object_list_batch: 4,
            puller_idle_ms: 5,
            retry_delay_ms: 20,
            discard_retry_delay_ms: 1,
            ..Self::default()
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn progress_log_interval(&self) -> Duration {
        Duration::from_millis(self.progress_log_interval_ms)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms)
    }

    pub fn map_sync_poll(&self) -> Duration {
        Duration::from_millis(self.map_sync_poll_ms)
    }

    pub fn scheduler_idle(&self) -> Duration {
        Duration::from_millis(self.scheduler_idle_ms)
    }

    pub fn puller_idle(&self) -> Duration {
        Duration::from_millis(self.puller_idle_ms)
    }

    pub fn discard_retry_delay(&self) -> Duration {
        Duration::from_millis(self.discard_retry_delay_ms)
    }

    /// Base retry delay plus up to 50% random jitter
    pub fn retry_delay(&self) -> Duration {
        use rand::Rng;
        let jitter = if self.retry_delay_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.retry_delay_ms / 2)
        };
        Duration::from_millis(self.retry_delay_ms + jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RebuildConfig::default();
        assert_eq!(config.max_running_pools, 4);
        assert_eq!(config.reclaim_boundary, ReclaimBoundary::StableEpoch);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_poll_interval_duration() {
        let config = RebuildConfig {
            poll_interval_ms: 120,
            ..Default::default()
        };
        assert_eq!(config.poll_interval(), Duration::from_millis(120));
    }

    #[test]
    fn test_retry_delay_jitter_bounds() {
        let config = RebuildConfig {
            retry_delay_ms: 100,
            ..Default::default()
        };
        for _ in 0..32 {
            let delay = config.retry_delay();
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(150));
        }
    }

    #[test]
    fn test_zero_budget_rejected() {
        let config = RebuildConfig {
            scan_yield_budget: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_reclaim_boundary_parse() {
        assert_eq!(
            "unbounded".parse::<ReclaimBoundary>().unwrap(),
            ReclaimBoundary::Unbounded
        );
        assert!("sometimes".parse::<ReclaimBoundary>().is_err());
    }
}
