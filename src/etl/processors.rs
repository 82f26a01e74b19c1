//! # Processor Contracts and Registry
//!
//! The concrete extract/transform/load logic lives outside the scheduling core.
//! Implementations register under the `type` discriminator of the specs they
//! handle; the registry is built once at startup and shared read-only.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{ExtractSpec, LoadSpec, TransformSpec};
use crate::error::{EtlError, Result};

/// A single metric sample moving through the pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transmutation {
    pub name: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl Transmutation {
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            timestamp: Utc::now(),
            value,
            tags: BTreeMap::new(),
        }
    }
}

/// One result row: the samples that travel to the load stage together
pub type Row = Vec<Transmutation>;

#[async_trait]
pub trait ExtractProcessor: Send + Sync {
    /// Spec discriminator this processor handles
    fn kind(&self) -> &str;

    /// Retrieve rows for every spec of this processor's kind in one configuration
    async fn execute(&self, specs: &[ExtractSpec]) -> Result<Vec<Row>>;
}

#[async_trait]
pub trait Transform: Send + Sync {
    fn kind(&self) -> &str;

    /// Polling transforms wait on an external completion. The pipeline runs
    /// them on the transform pool and re-applies them with exponential backoff
    /// while they return no rows.
    fn is_polling(&self) -> bool {
        false
    }

    async fn apply(&self, spec: &TransformSpec, input: Vec<Row>) -> Result<Vec<Row>>;
}

#[async_trait]
pub trait LoadProcessor: Send + Sync {
    fn kind(&self) -> &str;

    /// Deliver one row to the destination described by `specs`
    async fn execute(&self, row: &Row, specs: &[LoadSpec]) -> Result<()>;
}

/// Authentication contract of remote HTTP clients used by processors.
/// The scheduler never authenticates on its own; it only schedules the calls.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    async fn authenticate(&self) -> Result<()>;

    /// Current credential, authenticating first if needed
    async fn auth(&self) -> Result<String>;

    /// Drop the cached credential so the next `auth()` re-authenticates
    fn reset_auth(&self);
}

/// Run `operation`; on an authorization error reset the client's credential,
/// re-authenticate and try once more.
pub async fn with_reauth<C, F, Fut, T>(client: &C, mut operation: F) -> Result<T>
where
    C: RemoteClient + ?Sized,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match operation().await {
        Err(e) if e.is_authorization() => {
            warn!(error = %e, "Authorization rejected, re-authenticating remote client");
            client.reset_auth();
            client.authenticate().await?;
            operation().await
        }
        other => other,
    }
}

/// Discriminator -> implementation lookup for all three stages
#[derive(Default, Clone)]
pub struct ProcessorRegistry {
    extract: HashMap<String, Arc<dyn ExtractProcessor>>,
    transform: HashMap<String, Arc<dyn Transform>>,
    load: HashMap<String, Arc<dyn LoadProcessor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the built-in processors
    pub fn with_builtins() -> Self {
        Self::new()
            .with_extract(Arc::new(super::builtin::StaticExtract))
            .with_transform(Arc::new(super::builtin::ScaleTransform))
            .with_load(Arc::new(super::builtin::LogLoad))
    }

    pub fn with_extract(mut self, processor: Arc<dyn ExtractProcessor>) -> Self {
        debug!(kind = processor.kind(), "Registered extract processor");
        self.extract.insert(processor.kind().to_string(), processor);
        self
    }

    pub fn with_transform(mut self, transform: Arc<dyn Transform>) -> Self {
        debug!(kind = transform.kind(), "Registered transform");
        self.transform.insert(transform.kind().to_string(), transform);
        self
    }

    pub fn with_load(mut self, processor: Arc<dyn LoadProcessor>) -> Self {
        debug!(kind = processor.kind(), "Registered load processor");
        self.load.insert(processor.kind().to_string(), processor);
        self
    }

    pub fn extract_processor(&self, kind: &str) -> Result<Arc<dyn ExtractProcessor>> {
        self.extract
            .get(kind)
            .cloned()
            .ok_or_else(|| EtlError::Extract(format!("no extract processor registered for '{kind}'")))
    }

    pub fn transform(&self, kind: &str) -> Result<Arc<dyn Transform>> {
        self.transform
            .get(kind)
            .cloned()
            .ok_or_else(|| EtlError::Transform(format!("no transform registered for '{kind}'")))
    }

    pub fn load_processor(&self, kind: &str) -> Result<Arc<dyn LoadProcessor>> {
        self.load
            .get(kind)
            .cloned()
            .ok_or_else(|| EtlError::LoadStage(format!("no load processor registered for '{kind}'")))
    }
}

impl std::fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorRegistry")
            .field("extract", &self.extract.keys().collect::<Vec<_>>())
            .field("transform", &self.transform.keys().collect::<Vec<_>>())
            .field("load", &self.load.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Group specs by discriminator
pub fn group_by_kind(specs: &[super::StageSpec]) -> BTreeMap<String, Vec<super::StageSpec>> {
    let mut groups: BTreeMap<String, Vec<super::StageSpec>> = BTreeMap::new();
    for spec in specs {
        groups
            .entry(spec.kind().to_string())
            .or_default()
            .push(spec.clone());
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::etl::StageSpec;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FlakyClient {
        token: Mutex<Option<String>>,
        authentications: AtomicUsize,
    }

    #[async_trait]
    impl RemoteClient for FlakyClient {
        async fn authenticate(&self) -> Result<()> {
            let n = self.authentications.fetch_add(1, Ordering::SeqCst);
            *self.token.lock() = Some(format!("token-{n}"));
            Ok(())
        }

        async fn auth(&self) -> Result<String> {
            let missing = self.token.lock().is_none();
            if missing {
                self.authenticate().await?;
            }
            Ok(self.token.lock().clone().unwrap_or_default())
        }

        fn reset_auth(&self) {
            *self.token.lock() = None;
        }
    }

    #[tokio::test]
    async fn test_with_reauth_retries_once_after_authorization_error() {
        let client = FlakyClient::default();
        client.authenticate().await.unwrap();
        let counter = AtomicUsize::new(0);
        let calls = &counter;

        let result = with_reauth(&client, move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(EtlError::Authorization("expired".into()))
            } else {
                Ok(42)
            }
        })
        .await
        .unwrap();

        assert_eq!(result, 42);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(client.authentications.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_with_reauth_passes_other_errors_through() {
        let client = FlakyClient::default();
        let result: Result<()> =
            with_reauth(&client, || async { Err(EtlError::LoadStage("down".into())) }).await;
        assert!(matches!(result, Err(EtlError::LoadStage(_))));
        assert_eq!(client.authentications.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_registry_lookup() {
        let registry = ProcessorRegistry::with_builtins();
        assert!(registry.extract_processor("static").is_ok());
        assert!(registry.transform("scale").is_ok());
        assert!(registry.load_processor("log").is_ok());
        assert!(matches!(
            registry.extract_processor("prometheus"),
            Err(EtlError::Extract(_))
        ));
    }

    #[test]
    fn test_group_by_kind() {
        let specs = vec![
            StageSpec::new("b"),
            StageSpec::new("a"),
            StageSpec::new("b"),
        ];
        let groups = group_by_kind(&specs);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups["b"].len(), 2);
        assert_eq!(groups["a"].len(), 1);
    }
}
