//! Shared fixtures for integration tests

#![allow(dead_code)]

pub mod strategies;

use async_trait::async_trait;
use metrics_etl::etl::{LoadProcessor, LoadSpec, ProcessorRegistry, Row, StageSpec};
use metrics_etl::{Configuration, Result};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Load processor that remembers every row it receives
#[derive(Debug, Default)]
pub struct RecordingLoad {
    calls: AtomicUsize,
    rows: Mutex<Vec<Row>>,
}

impl RecordingLoad {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn rows(&self) -> Vec<Row> {
        self.rows.lock().clone()
    }
}

#[async_trait]
impl LoadProcessor for RecordingLoad {
    fn kind(&self) -> &str {
        "recording"
    }

    async fn execute(&self, row: &Row, _specs: &[LoadSpec]) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.rows.lock().push(row.clone());
        Ok(())
    }
}

pub fn registry_with(load: &Arc<RecordingLoad>) -> ProcessorRegistry {
    ProcessorRegistry::with_builtins().with_load(Arc::clone(load) as Arc<dyn LoadProcessor>)
}

/// A pipeline emitting one sample named `metric` every `interval_ms`
pub fn pipeline(metric: &str, interval_ms: u64) -> Configuration {
    Configuration::new(Duration::from_millis(interval_ms))
        .with_extract(
            StageSpec::new("static").with_param("points", json!([{"name": metric, "value": 1.0}])),
        )
        .with_load(StageSpec::new("recording"))
}

/// The JSON record form of [`pipeline`], as found in a configuration directory
pub fn pipeline_record(metric: &str, interval_ms: u64, factor: f64) -> String {
    json!({
        "repeatIntervalMillis": interval_ms,
        "extract": [{"type": "static", "points": [{"name": metric, "value": 2.0}]}],
        "transform": [{"type": "scale", "factor": factor}],
        "load": [{"type": "recording"}]
    })
    .to_string()
}
