//! # Configuration Reconciliation
//!
//! Keeps the desired set of configurations in line with the configuration
//! source and pushes the locally owned subset into the [`TaskManager`].
//!
//! - [`merge_configuration_sets`] computes and applies the delta between a
//!   freshly loaded set and the previous one
//! - [`SinglePartition`] / [`DistributedPartition`] hold the canonical set for
//!   unclustered and clustered operation
//! - [`ConfigurationUpdateManager`] is the control loop
//!
//! [`TaskManager`]: crate::scheduler::TaskManager

pub mod manager;
pub mod partition;

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::error::Result;
use crate::etl::{Configuration, ConfigurationSource, ConfigurationWrapper};

pub use manager::{ConfigurationUpdateManager, ManagerState, ManagerStats};
pub use partition::{DistributedPartition, SinglePartition};

/// Desired set: configuration identity -> runtime wrapper
pub type WrapperMap = HashMap<Arc<Configuration>, Arc<ConfigurationWrapper>>;

/// Result of one merge
#[derive(Debug, Clone, Default)]
pub struct DiffSummary {
    /// Wrappers created for configurations not seen before
    pub added: Vec<Arc<ConfigurationWrapper>>,
    pub removed: Vec<Arc<Configuration>>,
    /// Configurations present before and after; their wrappers were kept
    pub retained: usize,
}

impl DiffSummary {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

#[derive(Debug, Clone)]
pub enum UpdateOutcome {
    Applied(DiffSummary),
    /// Another update held the merge lock; the previous snapshot stays in place
    Skipped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PartitionStats {
    pub size: usize,
    pub updates: u64,
    pub failures: u64,
    pub skipped: u64,
}

/// Holder of the canonical desired set
pub trait ConfigurationPartition: Send + Sync {
    /// Load `source`, drop disabled records and merge the result in. On error
    /// the previous set is left untouched.
    fn update(&self, source: &dyn ConfigurationSource) -> Result<UpdateOutcome>;

    /// The Local Ownership Set
    fn get(&self) -> Vec<Arc<ConfigurationWrapper>>;

    /// The full desired set as seen by this node
    fn all(&self) -> Vec<Arc<Configuration>>;

    fn stats(&self) -> PartitionStats;
}

/// Merge `updated` into `existing`.
///
/// Configurations already present keep their wrapper (and therefore their
/// last run); new ones get a fresh wrapper; anything absent from `updated` is
/// removed. Duplicates in `updated` collapse into one entry.
pub fn merge_configuration_sets(
    updated: Vec<Configuration>,
    existing: &mut WrapperMap,
) -> Result<DiffSummary> {
    let mut summary = DiffSummary::default();
    let mut desired: HashSet<Arc<Configuration>> = HashSet::with_capacity(updated.len());

    for configuration in updated {
        let configuration = Arc::new(configuration);
        if !desired.insert(Arc::clone(&configuration)) {
            continue;
        }
        match existing.get(&configuration) {
            Some(wrapper) => {
                wrapper.update(configuration)?;
                summary.retained += 1;
            }
            None => {
                let wrapper = Arc::new(ConfigurationWrapper::new(Arc::clone(&configuration)));
                existing.insert(configuration, Arc::clone(&wrapper));
                summary.added.push(wrapper);
            }
        }
    }

    existing.retain(|configuration, _| {
        if desired.contains(configuration) {
            true
        } else {
            summary.removed.push(Arc::clone(configuration));
            false
        }
    });

    Ok(summary)
}
