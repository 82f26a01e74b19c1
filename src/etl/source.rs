//! # Configuration Sources
//!
//! Where the desired set of configuration records comes from. A load is
//! all-or-nothing: one bad file fails the whole scan so that a partially
//! written directory never shrinks the running set.

use parking_lot::RwLock;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::Configuration;
use crate::error::{EtlError, Result};

const MAX_RECORD_SIZE: u64 = 10 * 1024 * 1024;

pub trait ConfigurationSource: Send + Sync {
    /// Read the complete desired set
    fn load(&self) -> Result<Vec<Configuration>>;

    /// Human-readable description for logs
    fn describe(&self) -> String;
}

/// One JSON record per file; a directory is scanned non-recursively
#[derive(Debug, Clone)]
pub struct DirectorySource {
    path: PathBuf,
}

impl DirectorySource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn read_record(path: &Path) -> Result<Configuration> {
        let metadata = fs::metadata(path)?;
        if metadata.len() > MAX_RECORD_SIZE {
            return Err(EtlError::InvalidRecord(format!(
                "record is {} bytes, limit is {MAX_RECORD_SIZE}",
                metadata.len()
            )));
        }
        let content = fs::read_to_string(path)?;
        Ok(Configuration::from_json(&content)?.with_source(path))
    }

    fn candidate_files(&self) -> Result<Vec<PathBuf>> {
        if self.path.is_file() {
            return Ok(vec![self.path.clone()]);
        }

        let mut files = Vec::new();
        for entry in fs::read_dir(&self.path)? {
            let path = entry?.path();
            let is_json = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("json"));
            if path.is_file() && is_json {
                files.push(path);
            } else {
                debug!(path = %path.display(), "Skipping non-configuration entry");
            }
        }
        files.sort();
        Ok(files)
    }
}

impl ConfigurationSource for DirectorySource {
    fn load(&self) -> Result<Vec<Configuration>> {
        let files = self.candidate_files()?;
        let mut configurations = Vec::with_capacity(files.len());
        let mut errors = Vec::new();

        for file in files {
            match Self::read_record(&file) {
                Ok(configuration) => configurations.push(configuration),
                Err(e) => {
                    warn!(file = %file.display(), error = %e, "Failed to read configuration record");
                    errors.push(format!("{}: {e}", file.display()));
                }
            }
        }

        if let Some(error) = EtlError::aggregate_load(errors) {
            return Err(error);
        }

        debug!(
            path = %self.path.display(),
            count = configurations.len(),
            "Loaded configuration records"
        );
        Ok(configurations)
    }

    fn describe(&self) -> String {
        format!("directory {}", self.path.display())
    }
}

/// In-memory source whose contents can be replaced at runtime
#[derive(Debug)]
pub struct StaticSource {
    configurations: RwLock<std::result::Result<Vec<Configuration>, String>>,
}

impl StaticSource {
    pub fn new(configurations: Vec<Configuration>) -> Self {
        Self {
            configurations: RwLock::new(Ok(configurations)),
        }
    }

    pub fn replace(&self, configurations: Vec<Configuration>) {
        *self.configurations.write() = Ok(configurations);
    }

    /// Make subsequent loads fail with the given cause
    pub fn fail_with(&self, cause: impl Into<String>) {
        *self.configurations.write() = Err(cause.into());
    }
}

impl Default for StaticSource {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl ConfigurationSource for StaticSource {
    fn load(&self) -> Result<Vec<Configuration>> {
        match &*self.configurations.read() {
            Ok(configurations) => Ok(configurations.clone()),
            Err(cause) => Err(EtlError::Load {
                count: 1,
                first: cause.clone(),
                others: Vec::new(),
            }),
        }
    }

    fn describe(&self) -> String {
        "static".to_string()
    }
}
