#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Metrics ETL Core
//!
//! Scheduling and configuration-distribution core of a metrics ETL daemon.
//!
//! ## Overview
//!
//! A set of declarative pipeline [`Configuration`](etl::Configuration)s is
//! loaded from a source, reconciled against what is already running, and each
//! configuration is executed (extract -> transform -> load) on its own repeat
//! interval. In clustered mode the desired set lives in a shared map and every
//! node runs only the configurations whose partition it owns.
//!
//! ## Module Organization
//!
//! - [`config`] - Daemon settings, environment-aware loading
//! - [`error`] - Structured error handling
//! - [`etl`] - Configuration records, sources and stage processors
//! - [`scheduler`] - Task manager, pipeline execution, lifecycle
//! - [`reconcile`] - Diff/partition engine and the update control loop
//! - [`cluster`] - Cluster coordinator abstraction and implementations
//! - [`daemon`] - Bootstrap tying everything together
//! - [`logging`] / [`metrics`] - Observability
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use metrics_etl::cluster::StandaloneCoordinator;
//! use metrics_etl::config::ConfigManager;
//! use metrics_etl::etl::{DirectorySource, ProcessorRegistry};
//! use metrics_etl::EtlDaemon;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config_manager = ConfigManager::load_from_file("config/metrics-etl.yaml")?;
//! let source = Arc::new(DirectorySource::new(
//!     &config_manager.config().reconcile.configuration_path,
//! ));
//!
//! let daemon = EtlDaemon::new(
//!     config_manager,
//!     ProcessorRegistry::with_builtins(),
//!     source,
//!     Arc::new(StandaloneCoordinator::new()),
//! );
//! let completion = daemon.run().await?;
//! println!("daemon finished: {completion:?}");
//! # Ok(())
//! # }
//! ```
//!
//! ## Testing
//!
//! ```bash
//! cargo test --lib    # Unit tests
//! cargo test          # Unit + integration tests
//! ```

pub mod cluster;
pub mod config;
pub mod daemon;
pub mod error;
pub mod etl;
pub mod logging;
pub mod metrics;
pub mod reconcile;
pub mod scheduler;

pub use cluster::{ClusterCoordinator, ClusterEvent, DistributedMap};
pub use config::{ConfigManager, DaemonConfig};
pub use daemon::{DaemonStatus, EtlDaemon};
pub use error::{EtlError, Result};
pub use etl::{Configuration, ConfigurationSource, ConfigurationWrapper, ProcessorRegistry};
pub use reconcile::{merge_configuration_sets, ConfigurationUpdateManager};
pub use scheduler::{Completion, TaskManager};
