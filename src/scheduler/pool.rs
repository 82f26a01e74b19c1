//! # Stage Pools
//!
//! One bounded permit pool per pipeline stage. Capacity ascends from extract
//! to load so that, under contention, in-flight loads are never starved by a
//! burst of new extracts.

use std::fmt;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::StagePoolConfig;
use crate::error::{EtlError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Extract,
    Transform,
    Load,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Extract => "extract",
            Self::Transform => "transform",
            Self::Load => "load",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct StagePool {
    extract: Arc<Semaphore>,
    transform: Arc<Semaphore>,
    load: Arc<Semaphore>,
    config: StagePoolConfig,
}

impl StagePool {
    pub fn new(config: &StagePoolConfig) -> Self {
        Self {
            extract: Arc::new(Semaphore::new(config.extract_concurrency)),
            transform: Arc::new(Semaphore::new(config.transform_concurrency)),
            load: Arc::new(Semaphore::new(config.load_concurrency)),
            config: config.clone(),
        }
    }

    fn semaphore(&self, stage: Stage) -> &Arc<Semaphore> {
        match stage {
            Stage::Extract => &self.extract,
            Stage::Transform => &self.transform,
            Stage::Load => &self.load,
        }
    }

    /// Wait for a permit on `stage`'s pool. Fails only once the pools are closed.
    pub async fn acquire(&self, stage: Stage) -> Result<OwnedSemaphorePermit> {
        Arc::clone(self.semaphore(stage))
            .acquire_owned()
            .await
            .map_err(|_| EtlError::Shutdown(format!("{stage} pool closed")))
    }

    pub fn available(&self, stage: Stage) -> usize {
        self.semaphore(stage).available_permits()
    }

    pub fn capacity(&self, stage: Stage) -> usize {
        match stage {
            Stage::Extract => self.config.extract_concurrency,
            Stage::Transform => self.config.transform_concurrency,
            Stage::Load => self.config.load_concurrency,
        }
    }

    /// Refuse new permits; waiters fail with a shutdown error
    pub fn close(&self) {
        self.extract.close();
        self.transform.close();
        self.load.close();
    }
}
