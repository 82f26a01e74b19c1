//! # Configuration Records
//!
//! A [`Configuration`] is one immutable extract -> transform -> load pipeline
//! definition plus its repeat interval. Identity (equality and hashing) covers
//! the pipeline content only; where the record was loaded from is auxiliary.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{EtlError, Result};

/// One stage entry: a `type` discriminator plus free-form parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSpec {
    #[serde(rename = "type")]
    kind: String,
    #[serde(flatten)]
    params: Map<String, Value>,
}

pub type ExtractSpec = StageSpec;
pub type TransformSpec = StageSpec;
pub type LoadSpec = StageSpec;

impl StageSpec {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            params: Map::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    /// Discriminator used to resolve the processor for this spec
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    pub fn params(&self) -> &Map<String, Value> {
        &self.params
    }
}

impl StageSpec {
    /// Rendered params; serde_json maps are key-ordered so this is canonical.
    /// Equality and hashing both go through it, so `0.0` and `-0.0` differ.
    fn canonical_params(&self) -> String {
        Value::Object(self.params.clone()).to_string()
    }
}

impl PartialEq for StageSpec {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.canonical_params() == other.canonical_params()
    }
}

impl Eq for StageSpec {}

impl Hash for StageSpec {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
        self.canonical_params().hash(state);
    }
}

/// Immutable pipeline definition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Configuration {
    repeat_interval_millis: u64,
    #[serde(default)]
    extract: Vec<ExtractSpec>,
    #[serde(default)]
    transform: Vec<TransformSpec>,
    #[serde(default)]
    load: Vec<LoadSpec>,
    #[serde(default)]
    disabled: bool,
    #[serde(skip)]
    source: Option<PathBuf>,
}

impl Configuration {
    pub fn new(repeat_interval: Duration) -> Self {
        Self {
            repeat_interval_millis: u64::try_from(repeat_interval.as_millis()).unwrap_or(u64::MAX),
            extract: Vec::new(),
            transform: Vec::new(),
            load: Vec::new(),
            disabled: false,
            source: None,
        }
    }

    pub fn with_extract(mut self, spec: ExtractSpec) -> Self {
        self.extract.push(spec);
        self
    }

    pub fn with_transform(mut self, spec: TransformSpec) -> Self {
        self.transform.push(spec);
        self
    }

    pub fn with_load(mut self, spec: LoadSpec) -> Self {
        self.load.push(spec);
        self
    }

    pub fn with_disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    /// Record where this configuration was read from. Does not affect identity.
    pub fn with_source(mut self, source: impl Into<PathBuf>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Parse one JSON record and validate it
    pub fn from_json(json: &str) -> Result<Self> {
        let configuration: Configuration = serde_json::from_str(json)?;
        configuration.validate()?;
        Ok(configuration)
    }

    pub fn validate(&self) -> Result<()> {
        if self.repeat_interval_millis == 0 {
            return Err(EtlError::InvalidRecord(
                "repeatIntervalMillis must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn repeat_interval(&self) -> Duration {
        Duration::from_millis(self.repeat_interval_millis)
    }

    pub fn extract(&self) -> &[ExtractSpec] {
        &self.extract
    }

    pub fn transform(&self) -> &[TransformSpec] {
        &self.transform
    }

    pub fn load(&self) -> &[LoadSpec] {
        &self.load
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Short, stable identifier for logs
    pub fn fingerprint(&self) -> String {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        format!("{:016x}", hasher.finish())[..12].to_string()
    }
}

impl PartialEq for Configuration {
    fn eq(&self, other: &Self) -> bool {
        self.repeat_interval_millis == other.repeat_interval_millis
            && self.disabled == other.disabled
            && self.extract == other.extract
            && self.transform == other.transform
            && self.load == other.load
    }
}

impl Eq for Configuration {}

impl Hash for Configuration {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.repeat_interval_millis.hash(state);
        self.disabled.hash(state);
        self.extract.hash(state);
        self.transform.hash(state);
        self.load.hash(state);
    }
}
