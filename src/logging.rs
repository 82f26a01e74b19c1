//! # Structured Logging Module
//!
//! Environment-aware structured logging that outputs to both console and a JSON
//! file, plus helpers that give every task, reconciliation and cluster event a
//! consistent set of fields.

use chrono::Utc;
use std::fs;
use std::path::PathBuf;
use std::process;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging with environment-specific configuration
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let log_level = get_log_level(&environment);

        let log_dir = PathBuf::from("log");
        if let Err(e) = fs::create_dir_all(&log_dir) {
            eprintln!("Failed to create log directory {}: {e}", log_dir.display());
        }

        let pid = process::id();
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let log_filename = format!("{environment}.{pid}.{timestamp}.log");
        let log_path = log_dir.join(&log_filename);

        let file_appender = tracing_appender::rolling::never(&log_dir, log_filename);
        let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

        let subscriber = tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_level(true)
                    .with_ansi(true)
                    .with_filter(env_filter(&log_level)),
            )
            .with(
                fmt::layer()
                    .with_writer(file_writer)
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_level(true)
                    .with_ansi(false)
                    .json()
                    .with_filter(env_filter(&log_level)),
            );

        // An embedding application may already own the global subscriber
        if subscriber.try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized - continuing");
        }

        tracing::info!(
            pid = pid,
            environment = %environment,
            log_file = %log_path.display(),
            "STRUCTURED LOGGING: Initialized with file output"
        );

        // The writer must outlive every span for the whole process
        std::mem::forget(guard);
    });
}

fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Get current environment from environment variables
fn get_environment() -> String {
    std::env::var("METRICS_ETL_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

/// Get log level based on environment
fn get_log_level(environment: &str) -> String {
    match environment {
        "production" => "info".to_string(),
        _ => "debug".to_string(),
    }
}

/// Log a task lifecycle operation (upsert, remove, fire, complete)
pub fn log_task_operation(operation: &str, fingerprint: &str, status: &str, details: Option<&str>) {
    tracing::info!(
        operation = %operation,
        configuration = %fingerprint,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "TASK_OPERATION"
    );
}

/// Log the outcome of one reconciliation cycle
pub fn log_reconcile_operation(
    operation: &str,
    added: usize,
    removed: usize,
    retained: usize,
    status: &str,
) {
    tracing::info!(
        operation = %operation,
        added = added,
        removed = removed,
        retained = retained,
        status = %status,
        timestamp = %Utc::now().to_rfc3339(),
        "RECONCILE_OPERATION"
    );
}

/// Log a cluster topology event
pub fn log_cluster_event(event: &str, node_id: Option<&str>, details: Option<&str>) {
    tracing::info!(
        event = %event,
        node_id = node_id,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "CLUSTER_EVENT"
    );
}

/// Log error with full context
pub fn log_error(component: &str, operation: &str, error: &str, context: Option<&str>) {
    tracing::error!(
        component = %component,
        operation = %operation,
        error = %error,
        context = context,
        timestamp = %Utc::now().to_rfc3339(),
        "ERROR"
    );
}
