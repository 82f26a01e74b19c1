//! Built-in processors shipped with the daemon. They exist so that a fresh
//! install can run a self-contained pipeline; real deployments register their
//! own processors alongside them.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::info;

use super::processors::{ExtractProcessor, LoadProcessor, Row, Transform, Transmutation};
use super::{ExtractSpec, LoadSpec, TransformSpec};
use crate::error::{EtlError, Result};

#[derive(Debug, Deserialize)]
struct StaticPoint {
    name: String,
    value: f64,
    #[serde(default)]
    tags: BTreeMap<String, String>,
}

/// `{"type": "static", "points": [{"name": "...", "value": 1.0, "tags": {...}}]}`
///
/// Emits one row per spec holding that spec's points.
#[derive(Debug, Default, Clone, Copy)]
pub struct StaticExtract;

#[async_trait]
impl ExtractProcessor for StaticExtract {
    fn kind(&self) -> &str {
        "static"
    }

    async fn execute(&self, specs: &[ExtractSpec]) -> Result<Vec<Row>> {
        let mut rows = Vec::with_capacity(specs.len());
        for spec in specs {
            let points = match spec.param("points") {
                Some(value) => Vec::<StaticPoint>::deserialize(value)
                    .map_err(|e| EtlError::Extract(format!("invalid static points: {e}")))?,
                None => Vec::new(),
            };
            rows.push(
                points
                    .into_iter()
                    .map(|point| {
                        let mut sample = Transmutation::new(point.name, point.value);
                        sample.tags = point.tags;
                        sample
                    })
                    .collect(),
            );
        }
        Ok(rows)
    }
}

/// `{"type": "scale", "factor": 2.0}` multiplies every sample value
#[derive(Debug, Default, Clone, Copy)]
pub struct ScaleTransform;

#[async_trait]
impl Transform for ScaleTransform {
    fn kind(&self) -> &str {
        "scale"
    }

    async fn apply(&self, spec: &TransformSpec, input: Vec<Row>) -> Result<Vec<Row>> {
        let factor = spec
            .param("factor")
            .and_then(|v| v.as_f64())
            .ok_or_else(|| EtlError::Transform("scale requires a numeric 'factor'".to_string()))?;

        Ok(input
            .into_iter()
            .map(|row| {
                row.into_iter()
                    .map(|mut sample| {
                        sample.value *= factor;
                        sample
                    })
                    .collect()
            })
            .collect())
    }
}

/// `{"type": "log"}` writes each row to the structured log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogLoad;

#[async_trait]
impl LoadProcessor for LogLoad {
    fn kind(&self) -> &str {
        "log"
    }

    async fn execute(&self, row: &Row, specs: &[LoadSpec]) -> Result<()> {
        for sample in row {
            info!(
                name = %sample.name,
                value = sample.value,
                timestamp = %sample.timestamp,
                tags = ?sample.tags,
                destinations = specs.len(),
                "LOAD: sample"
            );
        }
        Ok(())
    }
}
