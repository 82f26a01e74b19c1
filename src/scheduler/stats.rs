use opentelemetry::KeyValue;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::error::EtlError;
use crate::metrics;

/// Snapshot of scheduler activity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TaskStats {
    pub active_tasks: usize,
    pub processing_tasks: usize,
    pub fires_executed: u64,
    pub fires_dropped: u64,
    pub pipeline_failures: u64,
    pub auth_failures: u64,
}

/// Live counters shared by every task; mirrored into OpenTelemetry
#[derive(Debug, Default)]
pub struct TaskCounters {
    processing: AtomicUsize,
    fires_executed: AtomicU64,
    fires_dropped: AtomicU64,
    pipeline_failures: AtomicU64,
    auth_failures: AtomicU64,
}

impl TaskCounters {
    pub fn processing(&self) -> usize {
        self.processing.load(Ordering::Acquire)
    }

    /// Count a pipeline as in flight until the guard drops, including on panic or abort
    pub fn start_processing(&self) -> ProcessingGuard<'_> {
        self.processing.fetch_add(1, Ordering::AcqRel);
        ProcessingGuard { counters: self }
    }

    pub fn fire_executed(&self) {
        self.fires_executed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fire_dropped(&self) -> u64 {
        metrics::fires_dropped().add(1, &[]);
        self.fires_dropped.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn pipeline_failure(&self, error: &EtlError) {
        self.pipeline_failures.fetch_add(1, Ordering::Relaxed);
        metrics::pipeline_failures().add(1, &[KeyValue::new("stage", error.stage())]);
        if error.is_authorization() {
            self.auth_failures.fetch_add(1, Ordering::Relaxed);
            metrics::auth_failures().add(1, &[]);
        }
    }

    pub fn snapshot(&self, active_tasks: usize) -> TaskStats {
        TaskStats {
            active_tasks,
            processing_tasks: self.processing(),
            fires_executed: self.fires_executed.load(Ordering::Relaxed),
            fires_dropped: self.fires_dropped.load(Ordering::Relaxed),
            pipeline_failures: self.pipeline_failures.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
        }
    }
}

pub struct ProcessingGuard<'a> {
    counters: &'a TaskCounters,
}

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.counters.processing.fetch_sub(1, Ordering::AcqRel);
    }
}
