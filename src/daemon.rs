//! # Daemon Bootstrap
//!
//! Wires the configuration source, processor registry, cluster coordinator,
//! [`TaskManager`] and [`ConfigurationUpdateManager`] together and drives them
//! until the run completes, fails or is asked to stop.
//!
//! Startup order:
//! 1. initialize the update manager against the coordinator
//! 2. run the first reconciliation cycle; failure here is fatal
//! 3. start the refresh loop and cluster listener
//!
//! In service mode Ctrl-C requests a graceful shutdown; in run-once mode the
//! daemon ends on its own once every task has fired once.

use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use crate::cluster::ClusterCoordinator;
use crate::config::ConfigManager;
use crate::error::Result;
use crate::etl::{ConfigurationSource, ProcessorRegistry};
use crate::reconcile::{ConfigurationUpdateManager, ManagerStats};
use crate::scheduler::{Completion, Lifecycle, ShutdownHandle, TaskManager, TaskStats};

/// Point-in-time view of a running daemon
#[derive(Debug, Clone, Serialize)]
pub struct DaemonStatus {
    pub environment: String,
    pub run_once: bool,
    pub clustered: bool,
    pub master: bool,
    pub shutting_down: bool,
    pub tasks: TaskStats,
    pub desired_set_size: usize,
    pub reconcile_cycles: u64,
}

pub struct EtlDaemon {
    config_manager: Arc<ConfigManager>,
    lifecycle: Arc<Lifecycle>,
    cluster: Arc<dyn ClusterCoordinator>,
    tasks: Arc<TaskManager>,
    updates: Arc<ConfigurationUpdateManager>,
}

impl std::fmt::Debug for EtlDaemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtlDaemon")
            .field("environment", &self.config_manager.environment())
            .field("node_id", &self.cluster.node_id())
            .field("tasks", &self.tasks)
            .finish()
    }
}

impl EtlDaemon {
    pub fn new(
        config_manager: Arc<ConfigManager>,
        registry: ProcessorRegistry,
        source: Arc<dyn ConfigurationSource>,
        cluster: Arc<dyn ClusterCoordinator>,
    ) -> Self {
        let config = config_manager.config();
        let lifecycle = Lifecycle::new();
        let tasks = TaskManager::new(config, Arc::new(registry), Arc::clone(&lifecycle));
        let updates = ConfigurationUpdateManager::new(config, source, Arc::clone(&tasks));
        Self {
            config_manager,
            lifecycle,
            cluster,
            tasks,
            updates,
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.lifecycle.handle()
    }

    pub fn task_manager(&self) -> &Arc<TaskManager> {
        &self.tasks
    }

    pub fn update_manager(&self) -> &Arc<ConfigurationUpdateManager> {
        &self.updates
    }

    pub fn status(&self) -> DaemonStatus {
        let ManagerStats {
            cycles, partition, ..
        } = self.updates.stats();
        DaemonStatus {
            environment: self.config_manager.environment().to_string(),
            run_once: self.tasks.is_run_once(),
            clustered: self.cluster.is_enabled(),
            master: self.cluster.is_master(),
            shutting_down: self.lifecycle.is_shutting_down(),
            tasks: self.tasks.stats(),
            desired_set_size: partition.size,
            reconcile_cycles: cycles,
        }
    }

    /// Run until completion, failure or shutdown; returns how the run ended.
    ///
    /// An error is returned only when startup itself fails.
    #[instrument(skip_all, fields(environment = %self.config_manager.environment()))]
    pub async fn run(&self) -> Result<Completion> {
        let scheduler = &self.config_manager.config().scheduler;
        info!(
            run_once = scheduler.run_once,
            clustered = self.cluster.is_enabled(),
            node_id = %self.cluster.node_id(),
            "DAEMON: Starting"
        );

        if let Err(e) = self.start() {
            error!(error = %e, "DAEMON: Startup failed");
            self.stop().await;
            return Err(e);
        }
        if let Err(e) = self.updates.run_cycle().await {
            error!(error = %e, "DAEMON: Initial reconciliation failed");
            self.lifecycle.fail(e.to_string());
            self.stop().await;
            return Err(e);
        }
        self.updates.start()?;
        info!(status = ?self.status(), "DAEMON: Running");

        let completion = if scheduler.run_once {
            tokio::select! {
                completion = self.lifecycle.wait_for_completion() => completion,
                _ = self.lifecycle.shutdown_requested() => self.lifecycle.completion(),
            }
        } else {
            tokio::select! {
                completion = self.lifecycle.wait_for_completion() => completion,
                _ = self.lifecycle.shutdown_requested() => self.lifecycle.completion(),
                signal = tokio::signal::ctrl_c() => {
                    if let Err(e) = signal {
                        warn!(error = %e, "DAEMON: Failed to listen for Ctrl-C");
                    }
                    info!("DAEMON: Interrupt received");
                    self.lifecycle.completion()
                }
            }
        };

        self.stop().await;
        // a clean stop in service mode is a completed run
        self.lifecycle.complete();
        let completion = match completion {
            Completion::Running => self.lifecycle.completion(),
            terminal => terminal,
        };
        info!(?completion, "DAEMON: Stopped");
        Ok(completion)
    }

    fn start(&self) -> Result<()> {
        self.updates.initialize(Arc::clone(&self.cluster))
    }

    /// Request shutdown and wait for in-flight work within the configured bound
    pub async fn stop(&self) {
        let timeout = self.config_manager.config().scheduler.shutdown_timeout();
        self.lifecycle.request_shutdown();
        self.updates.stop();
        let forced = self.tasks.shutdown(timeout).await;
        if forced > 0 {
            warn!(forced, "DAEMON: Tasks did not finish within the shutdown timeout");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::StandaloneCoordinator;
    use crate::config::DaemonConfig;
    use crate::etl::StaticSource;

    fn daemon(config: DaemonConfig, source: StaticSource) -> EtlDaemon {
        EtlDaemon::new(
            ConfigManager::from_config(config, "test").unwrap(),
            ProcessorRegistry::with_builtins(),
            Arc::new(source),
            Arc::new(StandaloneCoordinator::new()),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_once_with_nothing_to_do_completes() {
        let mut config = DaemonConfig::default();
        config.scheduler.run_once = true;

        let daemon = daemon(config, StaticSource::default());
        assert_eq!(daemon.run().await.unwrap(), Completion::Completed);
        assert!(daemon.status().shutting_down);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_load_failure_is_fatal() {
        let source = StaticSource::default();
        source.fail_with("no such directory");

        let daemon = daemon(DaemonConfig::default(), source);
        assert!(daemon.run().await.is_err());
        assert!(matches!(
            daemon.lifecycle.completion(),
            Completion::Failed(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_handle_stops_service_mode() {
        let daemon = Arc::new(daemon(DaemonConfig::default(), StaticSource::default()));
        let handle = daemon.shutdown_handle();

        let running = tokio::spawn({
            let daemon = Arc::clone(&daemon);
            async move { daemon.run().await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        handle.trigger();

        let completion = running.await.unwrap().unwrap();
        assert_eq!(completion, Completion::Completed);
        assert!(handle.is_triggered());
    }
}
