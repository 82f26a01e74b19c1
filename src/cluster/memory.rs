//! # In-Process Cluster
//!
//! Shared coordination state for several nodes living in one process. The
//! oldest live member is master; partitions are `hash(key) % partition_count`
//! and are dealt round-robin over members in join order. Every join or leave
//! re-deals the partitions and publishes one `MigrationCompleted` per moved
//! partition after the membership event.

use dashmap::{DashMap, DashSet};
use parking_lot::RwLock;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use super::{ClusterCoordinator, ClusterEvent, DistributedMap, EVENT_CHANNEL_CAPACITY};
use crate::error::{EtlError, Result};
use crate::etl::Configuration;
use crate::logging::log_cluster_event;

#[derive(Debug, Default)]
struct Topology {
    /// Live members, oldest first
    members: Vec<Uuid>,
    /// Owner per partition; empty while there are no members
    owners: Vec<Uuid>,
}

#[derive(Debug)]
struct ClusterState {
    partition_count: u32,
    topology: RwLock<Topology>,
    maps: DashMap<String, Arc<DashSet<Arc<Configuration>>>>,
    events: broadcast::Sender<ClusterEvent>,
}

impl ClusterState {
    fn partition_of(&self, configuration: &Configuration) -> u32 {
        let mut hasher = DefaultHasher::new();
        configuration.hash(&mut hasher);
        (hasher.finish() % u64::from(self.partition_count)) as u32
    }

    fn owner_of(&self, partition: u32) -> Option<Uuid> {
        self.topology.read().owners.get(partition as usize).copied()
    }

    fn is_master(&self, node_id: Uuid) -> bool {
        self.topology.read().members.first() == Some(&node_id)
    }

    /// Re-deal partitions over current members; returns the partitions that changed owner
    fn rebalance(&self, topology: &mut Topology) -> Vec<u32> {
        let previous = std::mem::take(&mut topology.owners);
        if topology.members.is_empty() {
            return Vec::new();
        }

        topology.owners = (0..self.partition_count as usize)
            .map(|partition| topology.members[partition % topology.members.len()])
            .collect();

        topology
            .owners
            .iter()
            .enumerate()
            .filter(|(partition, owner)| {
                previous
                    .get(*partition)
                    .is_some_and(|previous_owner| previous_owner != *owner)
            })
            .map(|(partition, _)| partition as u32)
            .collect()
    }

    fn publish(&self, membership: ClusterEvent, moved: Vec<u32>) {
        // no subscribers is fine
        let _ = self.events.send(membership);
        for partition in moved {
            let _ = self.events.send(ClusterEvent::MigrationCompleted { partition });
        }
    }
}

/// Handle to the shared cluster; cheap to clone
#[derive(Debug, Clone)]
pub struct InMemoryCluster {
    state: Arc<ClusterState>,
}

impl InMemoryCluster {
    pub fn new(partition_count: u32) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: Arc::new(ClusterState {
                partition_count: partition_count.max(1),
                topology: RwLock::new(Topology::default()),
                maps: DashMap::new(),
                events,
            }),
        }
    }

    /// Add a member and return its node handle
    pub fn join(&self) -> Arc<ClusterNode> {
        let node_id = Uuid::new_v4();
        let moved = {
            let mut topology = self.state.topology.write();
            topology.members.push(node_id);
            self.state.rebalance(&mut topology)
        };

        let id = node_id.to_string();
        log_cluster_event(
            "member_joined",
            Some(&id),
            Some(&format!("{} partitions migrated", moved.len())),
        );
        self.state.publish(ClusterEvent::MemberJoined(node_id), moved);

        Arc::new(ClusterNode {
            node_id,
            state: Arc::clone(&self.state),
            left: AtomicBool::new(false),
        })
    }

    /// Remove a member. Returns whether it was present.
    pub fn leave(&self, node_id: Uuid) -> bool {
        let moved = {
            let mut topology = self.state.topology.write();
            let before = topology.members.len();
            topology.members.retain(|member| *member != node_id);
            if topology.members.len() == before {
                return false;
            }
            self.state.rebalance(&mut topology)
        };

        let id = node_id.to_string();
        log_cluster_event(
            "member_left",
            Some(&id),
            Some(&format!("{} partitions migrated", moved.len())),
        );
        self.state.publish(ClusterEvent::MemberLeft(node_id), moved);
        true
    }

    pub fn members(&self) -> Vec<Uuid> {
        self.state.topology.read().members.clone()
    }

    pub fn master(&self) -> Option<Uuid> {
        self.state.topology.read().members.first().copied()
    }

    pub fn partition_count(&self) -> u32 {
        self.state.partition_count
    }

    pub fn partition_of(&self, configuration: &Configuration) -> u32 {
        self.state.partition_of(configuration)
    }

    pub fn owner_of(&self, partition: u32) -> Option<Uuid> {
        self.state.owner_of(partition)
    }
}

/// One member's view of an [`InMemoryCluster`]
#[derive(Debug)]
pub struct ClusterNode {
    node_id: Uuid,
    state: Arc<ClusterState>,
    left: AtomicBool,
}

impl ClusterNode {
    pub fn has_left(&self) -> bool {
        self.left.load(Ordering::Acquire)
    }

    /// Leave the cluster; this handle keeps reading but owns nothing
    pub fn leave(&self) {
        if self.left.swap(true, Ordering::AcqRel) {
            return;
        }
        InMemoryCluster {
            state: Arc::clone(&self.state),
        }
        .leave(self.node_id);
    }
}

impl ClusterCoordinator for ClusterNode {
    fn is_enabled(&self) -> bool {
        true
    }

    fn is_master(&self) -> bool {
        !self.has_left() && self.state.is_master(self.node_id)
    }

    fn node_id(&self) -> Uuid {
        self.node_id
    }

    fn distributed_map(&self, name: &str) -> Result<Arc<dyn DistributedMap>> {
        let entries = self
            .state
            .maps
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(DashSet::new()))
            .clone();
        Ok(Arc::new(NodeMap {
            name: name.to_string(),
            node_id: self.node_id,
            state: Arc::clone(&self.state),
            entries,
        }))
    }

    fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.state.events.subscribe()
    }
}

/// A node's handle on one shared map
#[derive(Debug)]
struct NodeMap {
    name: String,
    node_id: Uuid,
    state: Arc<ClusterState>,
    entries: Arc<DashSet<Arc<Configuration>>>,
}

impl NodeMap {
    fn ensure_master(&self, operation: &str) -> Result<()> {
        if self.state.is_master(self.node_id) {
            Ok(())
        } else {
            Err(EtlError::Cluster(format!(
                "node {} is not master and may not {operation} map '{}'",
                self.node_id, self.name
            )))
        }
    }
}

impl DistributedMap for NodeMap {
    fn name(&self) -> &str {
        &self.name
    }

    fn put(&self, configuration: Arc<Configuration>) -> Result<()> {
        self.ensure_master("write to")?;
        self.entries.insert(configuration);
        Ok(())
    }

    fn remove(&self, configuration: &Configuration) -> Result<bool> {
        self.ensure_master("remove from")?;
        Ok(self.entries.remove(configuration).is_some())
    }

    fn contains(&self, configuration: &Configuration) -> bool {
        self.entries.contains(configuration)
    }

    fn keys(&self) -> Vec<Arc<Configuration>> {
        self.entries.iter().map(|key| Arc::clone(&key)).collect()
    }

    fn local_keys(&self) -> Vec<Arc<Configuration>> {
        let local: Vec<_> = self
            .entries
            .iter()
            .filter(|key| self.state.owner_of(self.state.partition_of(key)) == Some(self.node_id))
            .map(|key| Arc::clone(&key))
            .collect();
        debug!(
            node_id = %self.node_id,
            local = local.len(),
            total = self.entries.len(),
            "Enumerated local partition keys"
        );
        local
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::time::Duration;

    fn configurations(n: u64) -> Vec<Arc<Configuration>> {
        (1..=n)
            .map(|i| Arc::new(Configuration::new(Duration::from_millis(i * 100))))
            .collect()
    }

    #[test]
    fn test_oldest_member_is_master() {
        let cluster = InMemoryCluster::new(16);
        let first = cluster.join();
        let second = cluster.join();

        assert!(first.is_master());
        assert!(!second.is_master());

        first.leave();
        assert!(!first.is_master());
        assert!(second.is_master());
        assert_eq!(cluster.members(), vec![second.node_id()]);
    }

    #[test]
    fn test_only_master_writes() {
        let cluster = InMemoryCluster::new(16);
        let master = cluster.join();
        let replica = cluster.join();
        let config = configurations(1).remove(0);

        let replica_map = replica.distributed_map("etl").unwrap();
        assert!(matches!(replica_map.put(Arc::clone(&config)), Err(EtlError::Cluster(_))));

        master.distributed_map("etl").unwrap().put(Arc::clone(&config)).unwrap();
        assert!(replica_map.contains(&config));
    }

    #[test]
    fn test_local_keys_partition_the_map() {
        let cluster = InMemoryCluster::new(7);
        let nodes = [cluster.join(), cluster.join(), cluster.join()];
        let master_map = nodes[0].distributed_map("etl").unwrap();
        for config in configurations(40) {
            master_map.put(config).unwrap();
        }

        let mut seen = HashSet::new();
        let mut total = 0;
        for node in &nodes {
            let local = node.distributed_map("etl").unwrap().local_keys();
            total += local.len();
            seen.extend(local);
        }
        assert_eq!(total, 40);
        assert_eq!(seen.len(), 40);
    }

    #[tokio::test]
    async fn test_join_publishes_membership_then_migrations() {
        let cluster = InMemoryCluster::new(4);
        let first = cluster.join();
        let mut events = first.subscribe();

        let second = cluster.join();
        assert_eq!(events.recv().await.unwrap(), ClusterEvent::MemberJoined(second.node_id()));

        // partitions 1 and 3 move to the second member
        let mut moved = Vec::new();
        while let Ok(ClusterEvent::MigrationCompleted { partition }) = events.try_recv() {
            moved.push(partition);
        }
        assert_eq!(moved, vec![1, 3]);
        assert_eq!(cluster.owner_of(1), Some(second.node_id()));
        assert_eq!(cluster.owner_of(0), Some(first.node_id()));
    }
}
