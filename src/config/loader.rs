//! Configuration Loader
//!
//! Environment-aware loading of daemon settings. A base file is layered with an
//! optional environment-specific sibling (`metrics-etl.production.yaml`) and
//! finally with `METRICS_ETL__SECTION__KEY` environment variables.

use super::error::{ConfigResult, ConfigurationError};
use super::DaemonConfig;
use config::{Config, Environment, File};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const ENV_PREFIX: &str = "METRICS_ETL";
const ENV_SEPARATOR: &str = "__";

/// Loaded, validated daemon settings plus where they came from
#[derive(Debug)]
pub struct ConfigManager {
    config: DaemonConfig,
    environment: String,
    config_file: Option<PathBuf>,
}

impl ConfigManager {
    /// Load configuration with environment auto-detection
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Arc<ConfigManager>> {
        let environment = Self::detect_environment();
        Self::load_from_file_with_env(path, &environment)
    }

    /// Load configuration from a file with an explicit environment.
    /// Useful for tests that must not depend on process-wide variables.
    pub fn load_from_file_with_env<P: AsRef<Path>>(
        path: P,
        environment: &str,
    ) -> ConfigResult<Arc<ConfigManager>> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(ConfigurationError::config_file_not_found(vec![
                path.to_path_buf()
            ]));
        }

        let override_path = Self::environment_override_path(path, environment);
        debug!(
            environment = %environment,
            base = %path.display(),
            override_file = ?override_path,
            "Loading daemon configuration"
        );

        let mut builder = Config::builder().add_source(File::from(path.to_path_buf()));
        if let Some(override_path) = override_path {
            builder = builder.add_source(File::from(override_path).required(false));
        }
        let settings = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ConfigurationError::source_error(path.display().to_string(), e))?;

        let config: DaemonConfig = settings
            .try_deserialize()
            .map_err(|e| ConfigurationError::source_error(path.display().to_string(), e))?;

        config.validate()?;

        info!(
            environment = %environment,
            run_once = config.scheduler.run_once,
            clustered = config.cluster.enabled,
            configuration_path = %config.reconcile.configuration_path.display(),
            "Daemon configuration loaded"
        );

        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_file: Some(path.to_path_buf()),
        }))
    }

    /// Build a manager around an already-constructed configuration
    pub fn from_config(config: DaemonConfig, environment: &str) -> ConfigResult<Arc<ConfigManager>> {
        config.validate()?;
        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_file: None,
        }))
    }

    /// All-defaults manager for the given environment
    pub fn default_for_env(environment: &str) -> Arc<ConfigManager> {
        Arc::new(ConfigManager {
            config: DaemonConfig::default(),
            environment: environment.to_string(),
            config_file: None,
        })
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn config_file(&self) -> Option<&Path> {
        self.config_file.as_deref()
    }

    /// Detect the environment from process variables
    pub fn detect_environment() -> String {
        env::var("METRICS_ETL_ENV")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string())
    }

    /// `dir/metrics-etl.yaml` + `production` -> `dir/metrics-etl.production.yaml`
    fn environment_override_path(path: &Path, environment: &str) -> Option<PathBuf> {
        let stem = path.file_stem()?.to_str()?;
        let file_name = match path.extension().and_then(|e| e.to_str()) {
            Some(ext) => format!("{stem}.{environment}.{ext}"),
            None => format!("{stem}.{environment}"),
        };
        Some(path.with_file_name(file_name))
    }
}
