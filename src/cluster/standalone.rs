use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::{ClusterCoordinator, ClusterEvent, DistributedMap, EVENT_CHANNEL_CAPACITY};
use crate::error::Result;
use crate::etl::Configuration;

/// Coordinator used when clustering is disabled: this node is always master
/// and owns every key.
#[derive(Debug)]
pub struct StandaloneCoordinator {
    node_id: Uuid,
    maps: DashMap<String, Arc<LocalMap>>,
    events: broadcast::Sender<ClusterEvent>,
}

impl StandaloneCoordinator {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            node_id: Uuid::new_v4(),
            maps: DashMap::new(),
            events,
        }
    }
}

impl Default for StandaloneCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterCoordinator for StandaloneCoordinator {
    fn is_enabled(&self) -> bool {
        false
    }

    fn is_master(&self) -> bool {
        true
    }

    fn node_id(&self) -> Uuid {
        self.node_id
    }

    fn distributed_map(&self, name: &str) -> Result<Arc<dyn DistributedMap>> {
        let map = self
            .maps
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(LocalMap::new(name)))
            .clone();
        Ok(map)
    }

    fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.events.subscribe()
    }
}

#[derive(Debug)]
pub struct LocalMap {
    name: String,
    entries: DashSet<Arc<Configuration>>,
}

impl LocalMap {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: DashSet::new(),
        }
    }
}

impl DistributedMap for LocalMap {
    fn name(&self) -> &str {
        &self.name
    }

    fn put(&self, configuration: Arc<Configuration>) -> Result<()> {
        self.entries.insert(configuration);
        Ok(())
    }

    fn remove(&self, configuration: &Configuration) -> Result<bool> {
        Ok(self.entries.remove(configuration).is_some())
    }

    fn contains(&self, configuration: &Configuration) -> bool {
        self.entries.contains(configuration)
    }

    fn keys(&self) -> Vec<Arc<Configuration>> {
        self.entries.iter().map(|key| Arc::clone(&key)).collect()
    }

    fn local_keys(&self) -> Vec<Arc<Configuration>> {
        self.keys()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_standalone_owns_everything() {
        let coordinator = StandaloneCoordinator::new();
        assert!(!coordinator.is_enabled());
        assert!(coordinator.is_master());

        let map = coordinator.distributed_map("etl").unwrap();
        let config = Arc::new(Configuration::new(Duration::from_secs(1)));
        map.put(Arc::clone(&config)).unwrap();

        // same name resolves to the same map
        let again = coordinator.distributed_map("etl").unwrap();
        assert!(again.contains(&config));
        assert_eq!(again.local_keys().len(), 1);
        assert!(again.remove(&config).unwrap());
        assert!(again.is_empty());
    }
}
