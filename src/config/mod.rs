//! # Daemon Configuration System
//!
//! Settings that control how the daemon schedules, reconciles and coordinates
//! work. These are distinct from the ETL *configuration records* themselves,
//! which live in [`crate::etl`] and are reloaded continuously.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use metrics_etl::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load_from_file_with_env("config/metrics-etl.yaml", "production")?;
//! let jitter = manager.config().scheduler.start_jitter_coefficient;
//! let refresh = manager.config().reconcile.refresh_interval();
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

/// Root daemon configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Task scheduling behaviour
    pub scheduler: SchedulerConfig,

    /// Per-stage concurrency limits
    pub pools: StagePoolConfig,

    /// Load-stage retry policy
    pub load: LoadRetryConfig,

    /// Backoff settings for polling-style transforms
    pub polling: PollingConfig,

    /// Reconciliation loop settings
    pub reconcile: ReconcileConfig,

    /// Cluster coordination settings
    pub cluster: ClusterConfig,
}

impl DaemonConfig {
    /// Validate cross-field constraints that serde cannot express
    pub fn validate(&self) -> ConfigResult<()> {
        let coefficient = self.scheduler.start_jitter_coefficient;
        if !(0.0..1.0).contains(&coefficient) {
            return Err(ConfigurationError::invalid_value(
                "scheduler.start_jitter_coefficient",
                coefficient.to_string(),
                "must be in [0, 1)",
            ));
        }

        if self.scheduler.fire_buffer == 0 {
            return Err(ConfigurationError::invalid_value(
                "scheduler.fire_buffer",
                "0",
                "fire channel needs room for at least one pending fire",
            ));
        }

        let pools = &self.pools;
        if pools.extract_concurrency == 0
            || pools.extract_concurrency >= pools.transform_concurrency
            || pools.transform_concurrency >= pools.load_concurrency
        {
            return Err(ConfigurationError::invalid_value(
                "pools",
                format!(
                    "{}/{}/{}",
                    pools.extract_concurrency, pools.transform_concurrency, pools.load_concurrency
                ),
                "concurrency must be non-zero and strictly ascending extract < transform < load",
            ));
        }

        for (field, value) in [
            ("reconcile.refresh_interval_ms", self.reconcile.refresh_interval_ms),
            ("reconcile.lock_timeout_ms", self.reconcile.lock_timeout_ms),
            ("polling.timeout_ms", self.polling.timeout_ms),
            ("polling.backoff_ms", self.polling.backoff_ms),
            ("scheduler.shutdown_timeout_ms", self.scheduler.shutdown_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigurationError::invalid_value(
                    field,
                    "0",
                    "must be greater than zero",
                ));
            }
        }

        if self.cluster.enabled && self.cluster.partition_count == 0 {
            return Err(ConfigurationError::invalid_value(
                "cluster.partition_count",
                "0",
                "clustered mode needs at least one partition",
            ));
        }

        Ok(())
    }
}

/// Task scheduling configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// First fire is delayed by `random() * coefficient * interval`
    pub start_jitter_coefficient: f64,
    /// Fire each configuration exactly once, then complete
    pub run_once: bool,
    /// Capacity of each task's fire channel; fires beyond it are dropped
    pub fire_buffer: usize,
    /// Bounded wait for in-flight pipelines during shutdown
    pub shutdown_timeout_ms: u64,
    /// Delay between a fatal runtime error and the process completion signal
    pub fatal_shutdown_delay_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            start_jitter_coefficient: 0.3,
            run_once: false,
            fire_buffer: 1,
            shutdown_timeout_ms: 30_000,
            fatal_shutdown_delay_ms: 5_000,
        }
    }
}

impl SchedulerConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn fatal_shutdown_delay(&self) -> Duration {
        Duration::from_millis(self.fatal_shutdown_delay_ms)
    }
}

/// Concurrency limits per pipeline stage, ascending so loads are never starved by extracts
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StagePoolConfig {
    pub extract_concurrency: usize,
    pub transform_concurrency: usize,
    pub load_concurrency: usize,
}

impl Default for StagePoolConfig {
    fn default() -> Self {
        Self {
            extract_concurrency: 4,
            transform_concurrency: 8,
            load_concurrency: 16,
        }
    }
}

/// Retry policy applied per load processor
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoadRetryConfig {
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for LoadRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_backoff_ms: 500,
        }
    }
}

impl LoadRetryConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// Exponential backoff for transforms that poll an external completion
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PollingConfig {
    pub initial_delay_ms: u64,
    pub backoff_ms: u64,
    pub timeout_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            backoff_ms: 500,
            timeout_ms: 60_000,
        }
    }
}

/// Reconciliation loop configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// File or directory holding the JSON configuration records
    pub configuration_path: PathBuf,
    pub refresh_interval_ms: u64,
    /// Maximum wait for the merge lock before a cycle is skipped
    pub lock_timeout_ms: u64,
    /// Window over which partition-migration events are coalesced
    pub migration_debounce_ms: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            configuration_path: PathBuf::from("configurations"),
            refresh_interval_ms: 60_000,
            lock_timeout_ms: 500,
            migration_debounce_ms: 10_000,
        }
    }
}

impl ReconcileConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn migration_debounce(&self) -> Duration {
        Duration::from_millis(self.migration_debounce_ms)
    }
}

/// Cluster coordination configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub enabled: bool,
    /// Name of the distributed map holding the canonical configuration set
    pub map_name: String,
    pub partition_count: u32,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            map_name: "etl-configurations".to_string(),
            partition_count: 271,
        }
    }
}
