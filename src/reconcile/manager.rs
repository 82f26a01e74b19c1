//! # Configuration Update Manager
//!
//! The reconciliation control loop. Each cycle loads the desired set, merges
//! it into the partition and pushes the locally owned subset into the
//! [`TaskManager`]. Cluster topology events trigger a resynchronization of
//! local tasks against the current ownership set; migration events are
//! debounced so a large rebalance costs one resynchronization.

use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use super::partition::{DistributedPartition, SinglePartition};
use super::{ConfigurationPartition, DiffSummary, PartitionStats, UpdateOutcome};
use crate::cluster::{ClusterCoordinator, ClusterEvent};
use crate::config::{ClusterConfig, DaemonConfig, ReconcileConfig};
use crate::error::{EtlError, Result};
use crate::etl::{Configuration, ConfigurationSource, ConfigurationWrapper};
use crate::logging::{log_cluster_event, log_error, log_reconcile_operation};
use crate::metrics;
use crate::scheduler::{Lifecycle, TaskManager};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Uninitialized,
    Initialized,
    Running,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ManagerStats {
    pub cycles: u64,
    pub failed_cycles: u64,
    pub resyncs: u64,
    pub partition: PartitionStats,
}

pub struct ConfigurationUpdateManager {
    reconcile: ReconcileConfig,
    cluster_config: ClusterConfig,
    source: Arc<dyn ConfigurationSource>,
    tasks: Arc<TaskManager>,
    lifecycle: Arc<Lifecycle>,
    state: RwLock<ManagerState>,
    cluster: OnceLock<Arc<dyn ClusterCoordinator>>,
    partition: OnceLock<Arc<dyn ConfigurationPartition>>,
    /// Set until a load/merge has actually been attempted
    first_attempt: AtomicBool,
    cycles: AtomicU64,
    failed_cycles: AtomicU64,
    resyncs: AtomicU64,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for ConfigurationUpdateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigurationUpdateManager")
            .field("state", &*self.state.read())
            .field("source", &self.source.describe())
            .field("clustered", &self.is_clustered())
            .finish()
    }
}

impl ConfigurationUpdateManager {
    pub fn new(
        config: &DaemonConfig,
        source: Arc<dyn ConfigurationSource>,
        tasks: Arc<TaskManager>,
    ) -> Arc<Self> {
        let lifecycle = Arc::clone(tasks.lifecycle());
        Arc::new(Self {
            reconcile: config.reconcile.clone(),
            cluster_config: config.cluster.clone(),
            source,
            tasks,
            lifecycle,
            state: RwLock::new(ManagerState::Uninitialized),
            cluster: OnceLock::new(),
            partition: OnceLock::new(),
            first_attempt: AtomicBool::new(true),
            cycles: AtomicU64::new(0),
            failed_cycles: AtomicU64::new(0),
            resyncs: AtomicU64::new(0),
            background: Mutex::new(Vec::new()),
        })
    }

    pub fn state(&self) -> ManagerState {
        *self.state.read()
    }

    pub fn is_clustered(&self) -> bool {
        self.cluster.get().is_some_and(|cluster| cluster.is_enabled())
    }

    /// Choose the backing store. Allowed exactly once.
    #[instrument(skip_all)]
    pub fn initialize(&self, cluster: Arc<dyn ClusterCoordinator>) -> Result<()> {
        let mut state = self.state.write();
        if *state != ManagerState::Uninitialized {
            return Err(EtlError::InvalidState(format!(
                "update manager already initialized (state {:?})",
                *state
            )));
        }

        let partition: Arc<dyn ConfigurationPartition> = if cluster.is_enabled() {
            let map = cluster.distributed_map(&self.cluster_config.map_name)?;
            info!(
                node_id = %cluster.node_id(),
                map = %self.cluster_config.map_name,
                master = cluster.is_master(),
                "RECONCILE: Using distributed configuration partition"
            );
            Arc::new(DistributedPartition::new(
                Arc::clone(&cluster),
                map,
                self.reconcile.lock_timeout(),
            ))
        } else {
            info!("RECONCILE: Using single configuration partition");
            Arc::new(SinglePartition::new(self.reconcile.lock_timeout()))
        };

        // both cells are empty while uninitialized and the state lock is held
        let _ = self.cluster.set(cluster);
        let _ = self.partition.set(partition);
        *state = ManagerState::Initialized;
        Ok(())
    }

    fn components(&self) -> Result<(Arc<dyn ClusterCoordinator>, Arc<dyn ConfigurationPartition>)> {
        match (self.cluster.get(), self.partition.get()) {
            (Some(cluster), Some(partition)) => Ok((Arc::clone(cluster), Arc::clone(partition))),
            _ => Err(EtlError::InvalidState(
                "update manager used before initialize()".to_string(),
            )),
        }
    }

    /// One reconciliation cycle.
    ///
    /// A failure on the very first load/merge is returned to the caller; later
    /// failures are logged and the previous set is kept.
    #[instrument(skip_all)]
    pub async fn run_cycle(&self) -> Result<()> {
        let (cluster, partition) = self.components()?;
        if self.lifecycle.is_shutting_down() {
            return Ok(());
        }
        self.cycles.fetch_add(1, Ordering::Relaxed);

        let clustered = cluster.is_enabled();
        if clustered && !cluster.is_master() {
            debug!("Not master, resynchronizing local tasks only");
            self.first_attempt.store(false, Ordering::Release);
            self.resync()?;
            metrics::record(metrics::reconcile_cycles(), "outcome", "resynchronized");
            self.after_cycle(partition.as_ref());
            return Ok(());
        }

        let source = Arc::clone(&self.source);
        let updater = Arc::clone(&partition);
        let result = tokio::task::spawn_blocking(move || updater.update(source.as_ref()))
            .await
            .map_err(|e| EtlError::InvalidState(format!("configuration update task failed: {e}")))
            .and_then(|outcome| outcome);

        match result {
            Ok(UpdateOutcome::Applied(summary)) => {
                self.first_attempt.store(false, Ordering::Release);
                metrics::record(metrics::reconcile_cycles(), "outcome", "applied");
                if clustered {
                    self.resync()?;
                } else {
                    self.apply(&summary);
                }
                self.after_cycle(partition.as_ref());
            }
            Ok(UpdateOutcome::Skipped) => {
                metrics::record(metrics::reconcile_cycles(), "outcome", "skipped");
                debug!("Configuration update skipped");
            }
            Err(e) => {
                self.failed_cycles.fetch_add(1, Ordering::Relaxed);
                metrics::record(metrics::reconcile_cycles(), "outcome", "failed");
                log_error("reconcile", "update", &e.to_string(), Some(&self.source.describe()));
                if self.first_attempt.swap(false, Ordering::AcqRel) {
                    error!(error = %e, "RECONCILE: Initial configuration load failed");
                    return Err(e);
                }
                warn!(error = %e, "RECONCILE: Configuration update failed, keeping previous set");
            }
        }
        Ok(())
    }

    /// Run-once bookkeeping after a cycle that produced a usable set
    fn after_cycle(&self, partition: &dyn ConfigurationPartition) {
        if !self.tasks.is_run_once() {
            return;
        }
        if partition.get().is_empty() && self.tasks.active_configurations().is_empty() {
            info!("RECONCILE: Nothing to run in run-once mode");
            self.lifecycle.complete();
        } else {
            self.tasks.arm_run_once_completion();
        }
    }

    /// Unclustered: apply the merge delta straight to the task manager
    fn apply(&self, summary: &DiffSummary) {
        for configuration in &summary.removed {
            self.tasks.remove(configuration);
        }
        for wrapper in &summary.added {
            self.schedule(Arc::clone(wrapper));
        }
        log_reconcile_operation(
            "apply",
            summary.added.len(),
            summary.removed.len(),
            summary.retained,
            "completed",
        );
    }

    fn schedule(&self, wrapper: Arc<ConfigurationWrapper>) {
        match self.tasks.upsert(wrapper) {
            Ok(()) => {}
            Err(e) if e.is_shutdown() => debug!(error = %e, "Not scheduling during shutdown"),
            Err(EtlError::InvalidState(reason)) if self.tasks.is_run_once() => {
                debug!(%reason, "Run-once pass already finished")
            }
            Err(e) => warn!(error = %e, "Failed to schedule configuration"),
        }
    }

    /// Align active tasks with the Local Ownership Set: stop what is no longer
    /// owned, start what is owned but not running.
    #[instrument(skip_all)]
    pub fn resync(&self) -> Result<()> {
        let (_, partition) = self.components()?;
        self.resyncs.fetch_add(1, Ordering::Relaxed);

        let owned = partition.get();
        let owned_keys: HashSet<Arc<Configuration>> =
            owned.iter().map(|wrapper| wrapper.configuration()).collect();

        let mut removed = 0;
        for active in self.tasks.active_configurations() {
            if !owned_keys.contains(&active) {
                self.tasks.remove(&active);
                removed += 1;
            }
        }

        let mut added = 0;
        for wrapper in owned {
            if !self.tasks.contains(&wrapper.configuration()) {
                self.schedule(wrapper);
                added += 1;
            }
        }

        let retained = owned_keys.len() - added;
        log_reconcile_operation("resync", added, removed, retained, "completed");
        Ok(())
    }

    /// Start the refresh loop (service mode only) and the cluster listener
    /// (clustered mode only).
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let (cluster, _) = self.components()?;
        {
            let mut state = self.state.write();
            if *state != ManagerState::Initialized {
                return Err(EtlError::InvalidState(format!(
                    "cannot start update manager in state {:?}",
                    *state
                )));
            }
            *state = ManagerState::Running;
        }

        let mut background = self.background.lock();
        if !self.tasks.is_run_once() {
            background.push(tokio::spawn(Arc::clone(self).refresh_loop()));
        }
        if cluster.is_enabled() {
            // subscribe before spawning so no event between now and the first poll is lost
            let events = cluster.subscribe();
            background.push(tokio::spawn(Arc::clone(self).cluster_listener(cluster, events)));
        }
        info!(loops = background.len(), "RECONCILE: Background loops started");
        Ok(())
    }

    /// Abort background loops; they also exit on their own at shutdown
    pub fn stop(&self) {
        for handle in self.background.lock().drain(..) {
            handle.abort();
        }
    }

    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            cycles: self.cycles.load(Ordering::Relaxed),
            failed_cycles: self.failed_cycles.load(Ordering::Relaxed),
            resyncs: self.resyncs.load(Ordering::Relaxed),
            partition: self
                .partition
                .get()
                .map(|partition| partition.stats())
                .unwrap_or_default(),
        }
    }

    async fn refresh_loop(self: Arc<Self>) {
        let interval = self.reconcile.refresh_interval();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.run_cycle().await {
                        error!(error = %e, "Reconciliation cycle failed");
                    }
                }
                _ = self.lifecycle.shutdown_requested() => {
                    info!("Refresh loop shutting down");
                    break;
                }
            }
        }
    }

    async fn cluster_listener(
        self: Arc<Self>,
        cluster: Arc<dyn ClusterCoordinator>,
        mut events: broadcast::Receiver<ClusterEvent>,
    ) {
        let debounce = self.reconcile.migration_debounce();
        let node_id = cluster.node_id().to_string();
        let mut flush_at: Option<Instant> = None;
        let mut buffered = 0usize;

        loop {
            let flush = async move {
                match flush_at {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = self.lifecycle.shutdown_requested() => {
                    info!("Cluster listener shutting down");
                    break;
                }
                _ = flush => {
                    log_cluster_event(
                        "migrations_settled",
                        Some(&node_id),
                        Some(&format!("{buffered} migrations coalesced")),
                    );
                    flush_at = None;
                    buffered = 0;
                    self.resync_logged();
                }
                event = events.recv() => match event {
                    Ok(ClusterEvent::MigrationCompleted { partition }) => {
                        buffered += 1;
                        debug!(partition, buffered, "Buffered partition migration");
                        flush_at.get_or_insert_with(|| Instant::now() + debounce);
                    }
                    Ok(event) => {
                        log_cluster_event(&event.to_string(), Some(&node_id), None);
                        self.resync_logged();
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "Cluster events lagged, resynchronizing");
                        self.resync_logged();
                    }
                    Err(RecvError::Closed) => {
                        info!("Cluster event stream closed");
                        break;
                    }
                }
            }
        }
    }

    fn resync_logged(&self) {
        if self.lifecycle.is_shutting_down() {
            return;
        }
        if let Err(e) = self.resync() {
            error!(error = %e, "Resynchronization failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{InMemoryCluster, StandaloneCoordinator};
    use crate::etl::{ProcessorRegistry, StageSpec, StaticSource};
    use std::time::Duration;

    fn daemon_config(run_once: bool) -> DaemonConfig {
        let mut config = DaemonConfig::default();
        config.scheduler.run_once = run_once;
        config.scheduler.start_jitter_coefficient = 0.0;
        config.reconcile.refresh_interval_ms = 1_000;
        config.reconcile.migration_debounce_ms = 500;
        config.cluster.partition_count = 16;
        config
    }

    fn record(interval_ms: u64) -> Configuration {
        Configuration::new(Duration::from_millis(interval_ms))
            .with_extract(StageSpec::new("static"))
            .with_load(StageSpec::new("log"))
    }

    fn manager(
        config: &DaemonConfig,
        source: Arc<StaticSource>,
    ) -> (Arc<ConfigurationUpdateManager>, Arc<TaskManager>) {
        let tasks = TaskManager::new(
            config,
            Arc::new(ProcessorRegistry::with_builtins()),
            Lifecycle::new(),
        );
        let manager = ConfigurationUpdateManager::new(config, source, Arc::clone(&tasks));
        (manager, tasks)
    }

    #[tokio::test]
    async fn test_initialize_only_once() {
        let (manager, _) = manager(&daemon_config(false), Arc::new(StaticSource::default()));
        assert!(matches!(manager.run_cycle().await, Err(EtlError::InvalidState(_))));

        manager.initialize(Arc::new(StandaloneCoordinator::new())).unwrap();
        assert_eq!(manager.state(), ManagerState::Initialized);
        assert!(manager
            .initialize(Arc::new(StandaloneCoordinator::new()))
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycles_track_the_source() {
        let config = daemon_config(false);
        let source = Arc::new(StaticSource::new(vec![record(100), record(200)]));
        let (manager, tasks) = manager(&config, Arc::clone(&source));
        manager.initialize(Arc::new(StandaloneCoordinator::new())).unwrap();

        manager.run_cycle().await.unwrap();
        assert_eq!(tasks.stats().active_tasks, 2);

        source.replace(vec![record(200), record(300), record(400).with_disabled(true)]);
        manager.run_cycle().await.unwrap();
        assert_eq!(tasks.stats().active_tasks, 2);
        assert!(tasks.contains(&record(300)));
        assert!(!tasks.contains(&record(100)));
        assert!(!tasks.contains(&record(400)));

        tasks.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_failure_is_fatal_later_failures_are_not() {
        let config = daemon_config(false);
        let source = Arc::new(StaticSource::new(vec![record(100)]));
        source.fail_with("unreadable directory");
        let (manager, tasks) = manager(&config, Arc::clone(&source));
        manager.initialize(Arc::new(StandaloneCoordinator::new())).unwrap();

        assert!(matches!(manager.run_cycle().await, Err(EtlError::Load { .. })));

        source.replace(vec![record(100)]);
        manager.run_cycle().await.unwrap();
        assert_eq!(tasks.stats().active_tasks, 1);

        source.fail_with("bad file");
        manager.run_cycle().await.unwrap();
        assert_eq!(tasks.stats().active_tasks, 1);
        assert_eq!(manager.stats().failed_cycles, 2);
        assert_eq!(manager.stats().partition.failures, 2);

        tasks.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_once_with_empty_set_completes() {
        let config = daemon_config(true);
        let (manager, tasks) = manager(&config, Arc::new(StaticSource::default()));
        manager.initialize(Arc::new(StandaloneCoordinator::new())).unwrap();

        manager.run_cycle().await.unwrap();
        assert_eq!(
            tasks.lifecycle().completion(),
            crate::scheduler::Completion::Completed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_loop_picks_up_changes() {
        let config = daemon_config(false);
        let source = Arc::new(StaticSource::new(vec![record(100)]));
        let (manager, tasks) = manager(&config, Arc::clone(&source));
        manager.initialize(Arc::new(StandaloneCoordinator::new())).unwrap();
        manager.run_cycle().await.unwrap();
        manager.start().unwrap();
        assert_eq!(manager.state(), ManagerState::Running);

        source.replace(vec![record(100), record(250)]);
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(tasks.stats().active_tasks, 2);

        tasks.lifecycle().request_shutdown();
        manager.stop();
        tasks.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_ownership_follows_membership() {
        let config = daemon_config(false);
        let cluster = InMemoryCluster::new(config.cluster.partition_count);
        let configurations: Vec<Configuration> = (1..=20).map(|i| record(i * 100)).collect();
        let source = Arc::new(StaticSource::new(configurations));

        let first_node = cluster.join();
        let (first, first_tasks) = manager(&config, Arc::clone(&source));
        first.initialize(first_node.clone()).unwrap();
        first.run_cycle().await.unwrap();
        first.start().unwrap();
        assert_eq!(first_tasks.stats().active_tasks, 20);

        let second_node = cluster.join();
        let (second, second_tasks) = manager(&config, Arc::clone(&source));
        second.initialize(second_node.clone()).unwrap();
        second.run_cycle().await.unwrap();
        second.start().unwrap();

        // wait out the migration debounce on the first node
        tokio::time::sleep(Duration::from_millis(600)).await;

        let on_first = first_tasks.stats().active_tasks;
        let on_second = second_tasks.stats().active_tasks;
        assert_eq!(on_first + on_second, 20);
        assert!(on_second > 0);
        assert!(first.stats().resyncs >= 2);

        // the survivor takes everything back
        second_node.leave();
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(first_tasks.stats().active_tasks, 20);

        first_tasks.lifecycle().request_shutdown();
        second_tasks.lifecycle().request_shutdown();
        first_tasks.shutdown(Duration::from_secs(1)).await;
        second_tasks.shutdown(Duration::from_secs(1)).await;
    }

    /// Enabled, always-master coordinator whose events the test drives by hand
    struct ScriptedCluster {
        node_id: uuid::Uuid,
        map: Arc<crate::cluster::standalone::LocalMap>,
        events: broadcast::Sender<ClusterEvent>,
    }

    impl ScriptedCluster {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                node_id: uuid::Uuid::new_v4(),
                map: Arc::new(crate::cluster::standalone::LocalMap::new("etl")),
                events: broadcast::channel(crate::cluster::EVENT_CHANNEL_CAPACITY).0,
            })
        }
    }

    impl ClusterCoordinator for ScriptedCluster {
        fn is_enabled(&self) -> bool {
            true
        }

        fn is_master(&self) -> bool {
            true
        }

        fn node_id(&self) -> uuid::Uuid {
            self.node_id
        }

        fn distributed_map(&self, _name: &str) -> Result<Arc<dyn crate::cluster::DistributedMap>> {
            Ok(Arc::clone(&self.map) as _)
        }

        fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
            self.events.subscribe()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_migrations_are_coalesced_into_one_resync() {
        let mut config = daemon_config(false);
        config.reconcile.refresh_interval_ms = 60_000;
        let cluster = ScriptedCluster::new();
        let (manager, tasks) = manager(&config, Arc::new(StaticSource::new(vec![record(100)])));
        manager.initialize(cluster.clone()).unwrap();
        manager.run_cycle().await.unwrap();
        manager.start().unwrap();
        assert_eq!(manager.stats().resyncs, 1);

        for partition in 0..32 {
            cluster
                .events
                .send(ClusterEvent::MigrationCompleted { partition })
                .unwrap();
        }

        // inside the 500ms window nothing happens
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(manager.stats().resyncs, 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(manager.stats().resyncs, 2);

        // and the window produced exactly one
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(manager.stats().resyncs, 2);

        // membership changes are not debounced
        cluster
            .events
            .send(ClusterEvent::MemberJoined(uuid::Uuid::new_v4()))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(manager.stats().resyncs, 3);

        tasks.lifecycle().request_shutdown();
        manager.stop();
        tasks.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_sent_right_after_start_are_seen() {
        let mut config = daemon_config(false);
        config.reconcile.refresh_interval_ms = 60_000;
        let cluster = ScriptedCluster::new();
        let (manager, tasks) = manager(&config, Arc::new(StaticSource::default()));
        manager.initialize(cluster.clone()).unwrap();
        manager.run_cycle().await.unwrap();
        manager.start().unwrap();

        // no yield between start() and the event
        cluster
            .events
            .send(ClusterEvent::MemberLeft(uuid::Uuid::new_v4()))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(manager.stats().resyncs, 2);

        tasks.lifecycle().request_shutdown();
        manager.stop();
        tasks.shutdown(Duration::from_secs(1)).await;
    }
}
