//! # Metrics ETL Daemon
//!
//! Loads pipeline configurations from a directory and runs them on their
//! repeat intervals, either as a long-running service or as a single pass.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use metrics_etl::cluster::{ClusterCoordinator, InMemoryCluster, StandaloneCoordinator};
use metrics_etl::config::ConfigManager;
use metrics_etl::etl::{DirectorySource, ProcessorRegistry};
use metrics_etl::logging::init_structured_logging;
use metrics_etl::scheduler::Completion;
use metrics_etl::EtlDaemon;

#[derive(Parser)]
#[command(name = "metrics-etl")]
#[command(about = "Run scheduled metrics extract/transform/load pipelines")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Daemon settings file (YAML, TOML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory of pipeline configuration records; overrides the settings file
    #[arg(long)]
    configurations: Option<PathBuf>,

    /// Fire every pipeline exactly once, then exit
    #[arg(long)]
    run_once: bool,

    /// Environment name used to pick override files (default: auto-detect)
    #[arg(short, long)]
    environment: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_structured_logging();

    let environment = cli
        .environment
        .clone()
        .unwrap_or_else(ConfigManager::detect_environment);
    let loaded = match &cli.config {
        Some(path) => ConfigManager::load_from_file_with_env(path, &environment)?,
        None => ConfigManager::default_for_env(&environment),
    };

    let mut config = loaded.config().clone();
    if let Some(path) = cli.configurations {
        config.reconcile.configuration_path = path;
    }
    config.scheduler.run_once |= cli.run_once;
    let config_manager = ConfigManager::from_config(config, &environment)?;
    let config = config_manager.config();

    info!(
        environment = %environment,
        configurations = %config.reconcile.configuration_path.display(),
        run_once = config.scheduler.run_once,
        "Starting metrics ETL daemon"
    );

    let cluster: Arc<dyn ClusterCoordinator> = if config.cluster.enabled {
        InMemoryCluster::new(config.cluster.partition_count).join()
    } else {
        Arc::new(StandaloneCoordinator::new())
    };
    let source = Arc::new(DirectorySource::new(&config.reconcile.configuration_path));

    let daemon = EtlDaemon::new(
        Arc::clone(&config_manager),
        ProcessorRegistry::with_builtins(),
        source,
        cluster,
    );

    match daemon.run().await? {
        Completion::Failed(reason) => {
            error!(%reason, "Daemon failed");
            anyhow::bail!("daemon failed: {reason}")
        }
        completion => {
            info!(?completion, "Daemon finished");
            Ok(())
        }
    }
}
