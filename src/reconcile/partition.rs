//! Partition strategies for the desired set.
//!
//! Both variants serialize writers through a merge lock acquired with a short
//! timeout; a writer that cannot get it skips the cycle. Readers never block
//! on the merge lock.

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{
    merge_configuration_sets, ConfigurationPartition, DiffSummary, PartitionStats, UpdateOutcome,
    WrapperMap,
};
use crate::cluster::{ClusterCoordinator, DistributedMap};
use crate::error::{EtlError, Result};
use crate::etl::{Configuration, ConfigurationSource, ConfigurationWrapper};
use crate::logging::log_reconcile_operation;
use crate::metrics;

#[derive(Debug, Default)]
struct PartitionCounters {
    updates: AtomicU64,
    failures: AtomicU64,
    skipped: AtomicU64,
}

impl PartitionCounters {
    fn applied(&self) {
        self.updates.fetch_add(1, Ordering::Relaxed);
    }

    fn failed(&self, reason: &'static str) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        metrics::record(metrics::merge_failures(), "reason", reason);
    }

    fn skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
        metrics::record(metrics::merge_failures(), "reason", "lock_timeout");
    }

    fn snapshot(&self, size: usize) -> PartitionStats {
        PartitionStats {
            size,
            updates: self.updates.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }
}

fn load_enabled(source: &dyn ConfigurationSource) -> Result<Vec<Configuration>> {
    let loaded = source.load()?;
    let total = loaded.len();
    let enabled: Vec<Configuration> = loaded.into_iter().filter(|c| !c.is_disabled()).collect();
    debug!(
        source = %source.describe(),
        total,
        disabled = total - enabled.len(),
        "Loaded desired set"
    );
    Ok(enabled)
}

/// Unclustered desired set: this node owns everything.
///
/// The set is published as an immutable snapshot that is swapped only after a
/// merge has fully succeeded.
#[derive(Debug)]
pub struct SinglePartition {
    snapshot: RwLock<Arc<WrapperMap>>,
    merge_lock: Mutex<()>,
    lock_timeout: Duration,
    counters: PartitionCounters,
}

impl SinglePartition {
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(WrapperMap::new())),
            merge_lock: Mutex::new(()),
            lock_timeout,
            counters: PartitionCounters::default(),
        }
    }

    pub fn snapshot(&self) -> Arc<WrapperMap> {
        Arc::clone(&self.snapshot.read())
    }
}

impl ConfigurationPartition for SinglePartition {
    fn update(&self, source: &dyn ConfigurationSource) -> Result<UpdateOutcome> {
        let Some(_merge) = self.merge_lock.try_lock_for(self.lock_timeout) else {
            self.counters.skipped();
            warn!(
                timeout_ms = self.lock_timeout.as_millis() as u64,
                "Configuration update already running, skipping"
            );
            return Ok(UpdateOutcome::Skipped);
        };

        let enabled = load_enabled(source).inspect_err(|_| self.counters.failed("load"))?;

        let mut next = WrapperMap::clone(&self.snapshot());
        let summary = merge_configuration_sets(enabled, &mut next)
            .inspect_err(|_| self.counters.failed("merge"))?;

        *self.snapshot.write() = Arc::new(next);
        self.counters.applied();
        log_reconcile_operation(
            "merge",
            summary.added.len(),
            summary.removed.len(),
            summary.retained,
            "applied",
        );
        Ok(UpdateOutcome::Applied(summary))
    }

    fn get(&self) -> Vec<Arc<ConfigurationWrapper>> {
        self.snapshot().values().cloned().collect()
    }

    fn all(&self) -> Vec<Arc<Configuration>> {
        self.snapshot().keys().cloned().collect()
    }

    fn stats(&self) -> PartitionStats {
        self.counters.snapshot(self.snapshot.read().len())
    }
}

/// Clustered desired set backed by a [`DistributedMap`].
///
/// Only the master writes the map. Every node keeps its own wrapper cache so
/// that last-run history survives reloads and resynchronizations while a key
/// stays local.
pub struct DistributedPartition {
    cluster: Arc<dyn ClusterCoordinator>,
    map: Arc<dyn DistributedMap>,
    wrappers: DashMap<Arc<Configuration>, Arc<ConfigurationWrapper>>,
    merge_lock: Mutex<()>,
    lock_timeout: Duration,
    counters: PartitionCounters,
}

impl std::fmt::Debug for DistributedPartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedPartition")
            .field("node_id", &self.cluster.node_id())
            .field("map", &self.map.name())
            .field("cached_wrappers", &self.wrappers.len())
            .finish()
    }
}

impl DistributedPartition {
    pub fn new(
        cluster: Arc<dyn ClusterCoordinator>,
        map: Arc<dyn DistributedMap>,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            cluster,
            map,
            wrappers: DashMap::new(),
            merge_lock: Mutex::new(()),
            lock_timeout,
            counters: PartitionCounters::default(),
        }
    }

    fn wrapper_for(&self, configuration: &Arc<Configuration>) -> Arc<ConfigurationWrapper> {
        self.wrappers
            .entry(Arc::clone(configuration))
            .or_insert_with(|| Arc::new(ConfigurationWrapper::new(Arc::clone(configuration))))
            .clone()
    }

    /// Write the delta to the map; on failure restore the keys touched so far
    fn publish(&self, summary: &DiffSummary) -> Result<()> {
        let mut put: Vec<Arc<Configuration>> = Vec::new();
        let mut removed: Vec<Arc<Configuration>> = Vec::new();

        let result = (|| -> Result<()> {
            for wrapper in &summary.added {
                let configuration = wrapper.configuration();
                self.map.put(Arc::clone(&configuration))?;
                put.push(configuration);
            }
            for configuration in &summary.removed {
                if self.map.remove(configuration)? {
                    removed.push(Arc::clone(configuration));
                }
            }
            Ok(())
        })();

        if let Err(e) = result {
            warn!(error = %e, put = put.len(), removed = removed.len(), "Rolling back distributed map");
            for configuration in &put {
                if let Err(rollback) = self.map.remove(configuration) {
                    warn!(error = %rollback, "Rollback of put failed");
                }
            }
            for configuration in removed {
                if let Err(rollback) = self.map.put(configuration) {
                    warn!(error = %rollback, "Rollback of remove failed");
                }
            }
            return Err(EtlError::Coordination(format!(
                "failed to publish configuration set to '{}': {e}",
                self.map.name()
            )));
        }
        Ok(())
    }
}

impl ConfigurationPartition for DistributedPartition {
    fn update(&self, source: &dyn ConfigurationSource) -> Result<UpdateOutcome> {
        if !self.cluster.is_master() {
            debug!("Not master, leaving the distributed set to the master");
            return Ok(UpdateOutcome::Skipped);
        }

        let Some(_merge) = self.merge_lock.try_lock_for(self.lock_timeout) else {
            self.counters.skipped();
            warn!(
                timeout_ms = self.lock_timeout.as_millis() as u64,
                "Configuration update already running, skipping"
            );
            return Ok(UpdateOutcome::Skipped);
        };

        let enabled = load_enabled(source).inspect_err(|_| self.counters.failed("load"))?;

        let mut next: WrapperMap = self
            .map
            .keys()
            .into_iter()
            .map(|configuration| {
                let wrapper = self.wrapper_for(&configuration);
                (configuration, wrapper)
            })
            .collect();
        let summary = merge_configuration_sets(enabled, &mut next)
            .inspect_err(|_| self.counters.failed("merge"))?;

        self.publish(&summary)
            .inspect_err(|_| self.counters.failed("publish"))?;

        for wrapper in &summary.added {
            self.wrappers.insert(wrapper.configuration(), Arc::clone(wrapper));
        }
        for configuration in &summary.removed {
            self.wrappers.remove(configuration);
        }

        self.counters.applied();
        info!(
            node_id = %self.cluster.node_id(),
            map = self.map.name(),
            size = next.len(),
            "Published configuration set"
        );
        log_reconcile_operation(
            "merge",
            summary.added.len(),
            summary.removed.len(),
            summary.retained,
            "published",
        );
        Ok(UpdateOutcome::Applied(summary))
    }

    fn get(&self) -> Vec<Arc<ConfigurationWrapper>> {
        let local: HashSet<Arc<Configuration>> = self.map.local_keys().into_iter().collect();
        self.wrappers.retain(|configuration, _| local.contains(configuration));
        local.iter().map(|configuration| self.wrapper_for(configuration)).collect()
    }

    fn all(&self) -> Vec<Arc<Configuration>> {
        self.map.keys()
    }

    fn stats(&self) -> PartitionStats {
        self.counters.snapshot(self.map.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterEvent, InMemoryCluster, StandaloneCoordinator};
    use crate::etl::StaticSource;
    use chrono::Utc;
    use std::sync::atomic::AtomicBool;
    use tokio::sync::broadcast;
    use uuid::Uuid;

    fn config(interval_ms: u64) -> Configuration {
        Configuration::new(Duration::from_millis(interval_ms))
    }

    fn intervals(configurations: Vec<Arc<Configuration>>) -> Vec<u64> {
        let mut intervals: Vec<u64> = configurations
            .iter()
            .map(|c| c.repeat_interval().as_millis() as u64)
            .collect();
        intervals.sort_unstable();
        intervals
    }

    #[test]
    fn test_single_partition_update_and_rollback() {
        let partition = SinglePartition::new(Duration::from_millis(50));
        let source = StaticSource::new(vec![config(1), config(2)]);

        let outcome = partition.update(&source).unwrap();
        assert!(matches!(outcome, UpdateOutcome::Applied(ref s) if s.added.len() == 2));
        assert_eq!(intervals(partition.all()), vec![1, 2]);

        source.fail_with("bad file");
        assert!(partition.update(&source).is_err());
        assert_eq!(intervals(partition.all()), vec![1, 2]);
        assert_eq!(partition.stats().failures, 1);
        assert_eq!(partition.stats().updates, 1);
    }

    #[test]
    fn test_disabled_records_are_filtered() {
        let partition = SinglePartition::new(Duration::from_millis(50));
        let source = StaticSource::new(vec![config(1), config(2).with_disabled(true)]);
        partition.update(&source).unwrap();
        assert_eq!(intervals(partition.all()), vec![1]);
    }

    #[test]
    fn test_single_partition_keeps_wrappers_across_reloads() {
        let partition = SinglePartition::new(Duration::from_millis(50));
        let source = StaticSource::new(vec![config(1)]);
        partition.update(&source).unwrap();

        let now = Utc::now();
        partition.get()[0].record_run(now);
        partition.update(&source).unwrap();
        assert_eq!(partition.get()[0].last_run(), Some(now));
    }

    #[test]
    fn test_concurrent_update_is_skipped() {
        let partition = SinglePartition::new(Duration::from_millis(20));
        let source = StaticSource::new(vec![config(1)]);

        let _held = partition.merge_lock.lock();
        let outcome = partition.update(&source).unwrap();
        assert!(matches!(outcome, UpdateOutcome::Skipped));
        assert_eq!(partition.stats().skipped, 1);
        assert!(partition.all().is_empty());
    }

    #[test]
    fn test_distributed_partition_on_standalone_map() {
        let coordinator: Arc<dyn ClusterCoordinator> = Arc::new(StandaloneCoordinator::new());
        let map = coordinator.distributed_map("etl").unwrap();
        let partition = DistributedPartition::new(coordinator, Arc::clone(&map), Duration::from_millis(50));

        let source = StaticSource::new(vec![config(1), config(2)]);
        partition.update(&source).unwrap();
        assert_eq!(map.len(), 2);

        source.replace(vec![config(2), config(3)]);
        let outcome = partition.update(&source).unwrap();
        let UpdateOutcome::Applied(summary) = outcome else {
            panic!("expected an applied update");
        };
        assert_eq!(summary.added.len(), 1);
        assert_eq!(summary.removed.len(), 1);
        assert_eq!(intervals(partition.all()), vec![2, 3]);
    }

    #[test]
    fn test_non_master_does_not_write() {
        let cluster = InMemoryCluster::new(8);
        let _master = cluster.join();
        let replica = cluster.join();
        let map = replica.distributed_map("etl").unwrap();
        let partition = DistributedPartition::new(replica, map, Duration::from_millis(50));

        let outcome = partition.update(&StaticSource::new(vec![config(1)])).unwrap();
        assert!(matches!(outcome, UpdateOutcome::Skipped));
        assert!(partition.all().is_empty());
    }

    /// Map that rejects writes while `broken` is set
    struct BrittleMap {
        inner: Arc<dyn DistributedMap>,
        broken: AtomicBool,
    }

    impl DistributedMap for BrittleMap {
        fn name(&self) -> &str {
            "brittle"
        }

        fn put(&self, configuration: Arc<Configuration>) -> Result<()> {
            if self.broken.load(Ordering::SeqCst) && configuration.repeat_interval() == Duration::from_millis(4) {
                return Err(EtlError::Cluster("replica unavailable".into()));
            }
            self.inner.put(configuration)
        }

        fn remove(&self, configuration: &Configuration) -> Result<bool> {
            self.inner.remove(configuration)
        }

        fn contains(&self, configuration: &Configuration) -> bool {
            self.inner.contains(configuration)
        }

        fn keys(&self) -> Vec<Arc<Configuration>> {
            self.inner.keys()
        }

        fn local_keys(&self) -> Vec<Arc<Configuration>> {
            self.inner.local_keys()
        }
    }

    struct FixedCoordinator;

    impl ClusterCoordinator for FixedCoordinator {
        fn is_enabled(&self) -> bool {
            true
        }

        fn is_master(&self) -> bool {
            true
        }

        fn node_id(&self) -> Uuid {
            Uuid::nil()
        }

        fn distributed_map(&self, _name: &str) -> Result<Arc<dyn DistributedMap>> {
            Err(EtlError::Cluster("not used".into()))
        }

        fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
            broadcast::channel(1).1
        }
    }

    #[test]
    fn test_failed_publish_restores_previous_set() {
        let inner = StandaloneCoordinator::new().distributed_map("etl").unwrap();
        let map = Arc::new(BrittleMap {
            inner,
            broken: AtomicBool::new(false),
        });
        let partition = DistributedPartition::new(
            Arc::new(FixedCoordinator),
            Arc::clone(&map) as Arc<dyn DistributedMap>,
            Duration::from_millis(50),
        );

        let source = StaticSource::new(vec![config(1), config(2)]);
        partition.update(&source).unwrap();

        map.broken.store(true, Ordering::SeqCst);
        source.replace(vec![config(2), config(3), config(4)]);
        let err = partition.update(&source).unwrap_err();

        assert!(matches!(err, EtlError::Coordination(_)));
        assert_eq!(intervals(partition.all()), vec![1, 2]);
        assert_eq!(partition.stats().failures, 1);
    }
}
