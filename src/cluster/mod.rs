//! # Cluster Coordination
//!
//! The contract the reconciler needs from a cluster: a leadership check, a
//! replicated map of configurations with local-partition enumeration, and a
//! stream of topology events.
//!
//! Two implementations ship with the crate:
//!
//! - [`StandaloneCoordinator`]: clustering disabled, this process owns everything
//! - [`InMemoryCluster`]: several nodes sharing one process, used for tests and
//!   single-host deployments

pub mod memory;
pub mod standalone;

use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::Result;
use crate::etl::Configuration;

pub use memory::{ClusterNode, InMemoryCluster};
pub use standalone::StandaloneCoordinator;

/// Capacity of the topology event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    MemberJoined(Uuid),
    MemberLeft(Uuid),
    /// Ownership of one partition moved to another node
    MigrationCompleted { partition: u32 },
}

impl fmt::Display for ClusterEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MemberJoined(id) => write!(f, "member_joined({id})"),
            Self::MemberLeft(id) => write!(f, "member_left({id})"),
            Self::MigrationCompleted { partition } => write!(f, "migration_completed({partition})"),
        }
    }
}

/// Replicated set of configurations keyed by identity.
///
/// Every node may read; only the master may write.
pub trait DistributedMap: Send + Sync {
    fn name(&self) -> &str;

    fn put(&self, configuration: Arc<Configuration>) -> Result<()>;

    /// Returns whether the key was present
    fn remove(&self, configuration: &Configuration) -> Result<bool>;

    fn contains(&self, configuration: &Configuration) -> bool;

    /// Every key in the map, regardless of owner
    fn keys(&self) -> Vec<Arc<Configuration>>;

    /// Keys in partitions owned by the calling node
    fn local_keys(&self) -> Vec<Arc<Configuration>>;

    fn len(&self) -> usize {
        self.keys().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub trait ClusterCoordinator: Send + Sync {
    fn is_enabled(&self) -> bool;

    /// Whether this node is the single writer of the canonical configuration set
    fn is_master(&self) -> bool;

    fn node_id(&self) -> Uuid;

    fn distributed_map(&self, name: &str) -> Result<Arc<dyn DistributedMap>>;

    /// Membership and migration events, delivered to every subscriber
    fn subscribe(&self) -> broadcast::Receiver<ClusterEvent>;
}
