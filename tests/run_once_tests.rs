//! End-to-end run-once passes over a configuration directory

mod common;

use common::{pipeline_record, registry_with, RecordingLoad};
use metrics_etl::cluster::StandaloneCoordinator;
use metrics_etl::etl::DirectorySource;
use metrics_etl::scheduler::Completion;
use metrics_etl::{ConfigManager, DaemonConfig, EtlDaemon};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn run_once_daemon(dir: &Path, load: &Arc<RecordingLoad>) -> EtlDaemon {
    let mut config = DaemonConfig::default();
    config.scheduler.run_once = true;
    config.scheduler.start_jitter_coefficient = 0.0;
    config.reconcile.configuration_path = dir.to_path_buf();

    EtlDaemon::new(
        ConfigManager::from_config(config, "test").unwrap(),
        registry_with(load),
        Arc::new(DirectorySource::new(dir)),
        Arc::new(StandaloneCoordinator::new()),
    )
}

#[tokio::test]
async fn test_run_once_fires_every_enabled_configuration_once() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("a.json"), pipeline_record("cpu", 60_000, 3.0)).unwrap();
    fs::write(dir.path().join("b.json"), pipeline_record("mem", 120_000, 0.5)).unwrap();
    fs::write(
        dir.path().join("c.json"),
        r#"{"repeatIntervalMillis": 1000, "disabled": true, "load": [{"type": "recording"}]}"#,
    )
    .unwrap();
    fs::write(dir.path().join("notes.txt"), "not a record").unwrap();

    let load = Arc::new(RecordingLoad::default());
    let daemon = run_once_daemon(dir.path(), &load);

    let completion = tokio::time::timeout(Duration::from_secs(10), daemon.run())
        .await
        .expect("run-once pass should finish")
        .unwrap();

    assert_eq!(completion, Completion::Completed);
    assert_eq!(load.calls(), 2);

    let mut values: Vec<(String, f64)> = load
        .rows()
        .into_iter()
        .flatten()
        .map(|sample| (sample.name, sample.value))
        .collect();
    values.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(values, vec![("cpu".to_string(), 6.0), ("mem".to_string(), 1.0)]);

    let stats = daemon.task_manager().stats();
    assert_eq!(stats.fires_executed, 2);
    assert_eq!(stats.active_tasks, 0);
}

#[tokio::test]
async fn test_run_once_with_empty_directory_completes_without_work() {
    let dir = TempDir::new().unwrap();
    let load = Arc::new(RecordingLoad::default());
    let daemon = run_once_daemon(dir.path(), &load);

    let completion = tokio::time::timeout(Duration::from_secs(10), daemon.run())
        .await
        .expect("empty run-once pass should finish")
        .unwrap();

    assert_eq!(completion, Completion::Completed);
    assert_eq!(load.calls(), 0);
}

#[tokio::test]
async fn test_unreadable_record_fails_startup() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("good.json"), pipeline_record("cpu", 1_000, 1.0)).unwrap();
    fs::write(dir.path().join("bad.json"), "{ not json").unwrap();

    let load = Arc::new(RecordingLoad::default());
    let daemon = run_once_daemon(dir.path(), &load);

    let error = daemon.run().await.unwrap_err();
    assert!(error.to_string().contains("bad.json"));
    assert_eq!(load.calls(), 0);
}
