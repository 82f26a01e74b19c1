//! # Three-Stage Pipeline
//!
//! Executes one fire of a configuration: extract fan-out, the sequential
//! transform chain, then per-row load fan-out with retries. Each stage runs
//! under its own [`StagePool`] permits.

use futures::future::{join_all, try_join_all};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use super::backoff::{poll_with_backoff, PollingBackoff};
use super::pool::{Stage, StagePool};
use super::stats::TaskCounters;
use crate::config::{DaemonConfig, LoadRetryConfig};
use crate::error::{EtlError, Result};
use crate::etl::{
    group_by_kind, Configuration, ExtractSpec, LoadProcessor, LoadSpec, ProcessorRegistry, Row,
    TransformSpec,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineOutcome {
    pub rows_extracted: usize,
    pub rows_loaded: usize,
    /// Row/processor deliveries that still failed after every retry
    pub load_failures: usize,
}

#[derive(Debug)]
pub struct Pipeline {
    registry: Arc<ProcessorRegistry>,
    pools: StagePool,
    retry: LoadRetryConfig,
    polling: PollingBackoff,
    counters: Arc<TaskCounters>,
}

impl Pipeline {
    pub fn new(
        registry: Arc<ProcessorRegistry>,
        config: &DaemonConfig,
        counters: Arc<TaskCounters>,
    ) -> Self {
        Self {
            registry,
            pools: StagePool::new(&config.pools),
            retry: config.load.clone(),
            polling: PollingBackoff::from(&config.polling),
            counters,
        }
    }

    pub fn pools(&self) -> &StagePool {
        &self.pools
    }

    /// Run extract -> transform -> load once. A failing extract or transform
    /// ends this fire early; load failures are counted per delivery instead.
    #[instrument(skip_all, fields(configuration = %configuration.fingerprint()))]
    pub async fn execute(&self, configuration: &Configuration) -> Result<PipelineOutcome> {
        let rows = self.extract(configuration.extract()).await?;
        let rows_extracted = rows.len();

        let rows = self.transform(configuration.transform(), rows).await?;
        let (rows_loaded, load_failures) = self.load(configuration.load(), &rows).await?;

        debug!(rows_extracted, rows_loaded, load_failures, "Pipeline finished");
        Ok(PipelineOutcome {
            rows_extracted,
            rows_loaded,
            load_failures,
        })
    }

    async fn extract(&self, specs: &[ExtractSpec]) -> Result<Vec<Row>> {
        let pools = &self.pools;
        let mut calls = Vec::new();
        for (kind, specs) in group_by_kind(specs) {
            let processor = self.registry.extract_processor(&kind)?;
            calls.push(async move {
                let _permit = pools.acquire(Stage::Extract).await?;
                processor.execute(&specs).await
            });
        }

        let results = try_join_all(calls).await?;
        Ok(results.into_iter().flatten().collect())
    }

    async fn transform(&self, specs: &[TransformSpec], mut rows: Vec<Row>) -> Result<Vec<Row>> {
        for spec in specs {
            let transform = self.registry.transform(spec.kind())?;
            if !transform.is_polling() {
                rows = transform.apply(spec, rows).await?;
                continue;
            }

            let _permit = self.pools.acquire(Stage::Transform).await?;
            let transform = &transform;
            let input = &rows;
            let polled = poll_with_backoff(self.polling, move |attempt| async move {
                debug!(kind = spec.kind(), attempt, "Polling transform");
                let output = transform.apply(spec, input.clone()).await?;
                Ok(if output.iter().all(Vec::is_empty) {
                    None
                } else {
                    Some(output)
                })
            })
            .await?;

            rows = match polled {
                Some(output) => output,
                None => {
                    warn!(kind = spec.kind(), "Polling transform timed out, continuing with no data");
                    Vec::new()
                }
            };
        }
        Ok(rows)
    }

    /// Returns `(rows fully delivered, failed deliveries)`
    async fn load(&self, specs: &[LoadSpec], rows: &[Row]) -> Result<(usize, usize)> {
        let mut groups: Vec<(Arc<dyn LoadProcessor>, Vec<LoadSpec>)> = Vec::new();
        for (kind, specs) in group_by_kind(specs) {
            groups.push((self.registry.load_processor(&kind)?, specs));
        }
        if groups.is_empty() {
            return Ok((0, 0));
        }

        let failures_per_row = join_all(rows.iter().map(|row| self.load_row(row, &groups))).await;
        let rows_loaded = failures_per_row.iter().filter(|failed| **failed == 0).count();
        Ok((rows_loaded, failures_per_row.into_iter().sum()))
    }

    async fn load_row(&self, row: &Row, groups: &[(Arc<dyn LoadProcessor>, Vec<LoadSpec>)]) -> usize {
        let deliveries = groups
            .iter()
            .map(|(processor, specs)| self.deliver(processor.as_ref(), row, specs));

        let mut failed = 0;
        for result in join_all(deliveries).await {
            if let Err(e) = result {
                if !e.is_shutdown() {
                    self.counters.pipeline_failure(&e);
                    warn!(error = %e, samples = row.len(), "Load delivery failed after retries");
                }
                failed += 1;
            }
        }
        failed
    }

    async fn deliver(&self, processor: &dyn LoadProcessor, row: &Row, specs: &[LoadSpec]) -> Result<()> {
        let mut attempt = 0;
        loop {
            let result = {
                let _permit = self.pools.acquire(Stage::Load).await?;
                processor.execute(row, specs).await
            };
            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_shutdown() || attempt >= self.retry.max_retries => return Err(e),
                Err(e) => {
                    attempt += 1;
                    let wait = self.retry.retry_backoff() * attempt;
                    debug!(
                        kind = processor.kind(),
                        attempt,
                        wait_ms = wait.as_millis() as u64,
                        error = %e,
                        "Retrying load"
                    );
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }
}

/// Interrupted stages are expected once shutdown has begun and are not reported
pub fn is_expected_during_shutdown(error: &EtlError, shutting_down: bool) -> bool {
    shutting_down && error.is_shutdown()
}
