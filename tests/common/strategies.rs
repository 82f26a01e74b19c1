//! Proptest strategies for configuration sets

use metrics_etl::Configuration;
use proptest::prelude::*;
use std::time::Duration;

/// Small interval domain so generated sets overlap often
pub fn configuration_strategy() -> impl Strategy<Value = Configuration> {
    (1u64..40).prop_map(|interval| Configuration::new(Duration::from_millis(interval * 50)))
}

pub fn configuration_set_strategy() -> impl Strategy<Value = Vec<Configuration>> {
    prop::collection::vec(configuration_strategy(), 0..30)
}
