//! # Error Types
//!
//! Crate-wide error taxonomy for the ETL scheduling core. Every failure the
//! daemon can observe maps onto one of these variants so that logging and
//! counters can classify it without string matching.

use thiserror::Error;

use crate::config::ConfigurationError;

#[derive(Debug, Error)]
pub enum EtlError {
    /// Daemon settings could not be loaded or failed validation
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    /// One or more configuration records in a source could not be loaded.
    /// `first` is the first cause found, `others` the remaining causes in scan order.
    #[error("Failed to load {count} configuration file(s); first error: {first}")]
    Load {
        count: usize,
        first: String,
        others: Vec<String>,
    },

    /// A configuration record was syntactically valid but semantically wrong
    #[error("Invalid configuration record: {0}")]
    InvalidRecord(String),

    #[error("Extract error: {0}")]
    Extract(String),

    #[error("Transform error: {0}")]
    Transform(String),

    #[error("Load stage error: {0}")]
    LoadStage(String),

    /// Surfaced by remote clients when credentials are rejected
    #[error("Authorization error: {0}")]
    Authorization(String),

    /// Merge lock contention or a failed write to the configuration store
    #[error("Coordination error: {0}")]
    Coordination(String),

    #[error("Cluster error: {0}")]
    Cluster(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    /// Work was interrupted because the process is shutting down
    #[error("Shutdown in progress: {0}")]
    Shutdown(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EtlError {
    /// Build an aggregate load error from the collected per-file failures.
    ///
    /// Returns `None` when there is nothing to report.
    pub fn aggregate_load(mut errors: Vec<String>) -> Option<Self> {
        if errors.is_empty() {
            return None;
        }
        let count = errors.len();
        let first = errors.remove(0);
        Some(Self::Load {
            count,
            first,
            others: errors,
        })
    }

    pub fn is_authorization(&self) -> bool {
        matches!(self, Self::Authorization(_))
    }

    /// Errors that are expected while the process winds down and should not be reported
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown(_))
    }

    /// Short stage label used for metrics and structured logs
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Extract(_) => "extract",
            Self::Transform(_) => "transform",
            Self::LoadStage(_) => "load",
            Self::Authorization(_) => "authorization",
            Self::Load { .. } | Self::InvalidRecord(_) | Self::Json(_) => "configuration_load",
            Self::Coordination(_) | Self::Cluster(_) => "coordination",
            _ => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, EtlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_load_keeps_first_cause() {
        let err = EtlError::aggregate_load(vec![
            "a.json: bad".to_string(),
            "b.json: worse".to_string(),
            "c.json: worst".to_string(),
        ])
        .unwrap();

        match &err {
            EtlError::Load {
                count,
                first,
                others,
            } => {
                assert_eq!(*count, 3);
                assert_eq!(first, "a.json: bad");
                assert_eq!(others.len(), 2);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
        assert!(err.to_string().contains("3 configuration file(s)"));
    }

    #[test]
    fn test_aggregate_load_empty_is_none() {
        assert!(EtlError::aggregate_load(Vec::new()).is_none());
    }

    #[test]
    fn test_classification() {
        assert!(EtlError::Authorization("401".into()).is_authorization());
        assert!(!EtlError::Extract("boom".into()).is_authorization());
        assert!(EtlError::Shutdown("closing".into()).is_shutdown());
        assert_eq!(EtlError::LoadStage("x".into()).stage(), "load");
        assert_eq!(EtlError::Coordination("x".into()).stage(), "coordination");
    }
}
