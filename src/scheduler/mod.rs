//! # Task Manager
//!
//! Owns one recurring pipeline per [`Configuration`]. Each Active Task is a
//! pair of tokio tasks joined by a bounded channel:
//!
//! - the **subscription** (producer) sleeps until the next fire deadline and
//!   sends a fire event without blocking; a full channel means the previous
//!   fire is still draining and the event is dropped and counted.
//! - the **publisher** (consumer) receives fire events and runs the
//!   three-stage [`Pipeline`] for each one, in order.
//!
//! The registry is a single [`DashMap`] keyed by configuration identity, so
//! every mutation is a single-key insert, replace or remove.

pub mod backoff;
pub mod lifecycle;
pub mod pipeline;
pub mod pool;
pub mod stats;
pub mod timing;

use chrono::Utc;
use futures::future::join_all;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{DaemonConfig, SchedulerConfig};
use crate::error::{EtlError, Result};
use crate::etl::{Configuration, ConfigurationWrapper, ProcessorRegistry};
use crate::logging::{log_error, log_task_operation};

pub use backoff::{poll_with_backoff, PollingBackoff};
pub use lifecycle::{Completion, Lifecycle, ShutdownHandle};
pub use pipeline::{Pipeline, PipelineOutcome};
pub use pool::{Stage, StagePool};
pub use stats::{TaskCounters, TaskStats};

/// Runtime state bound 1:1 to a configuration that is currently scheduled
struct ActiveTask {
    id: u64,
    wrapper: Arc<ConfigurationWrapper>,
    cancelled: Arc<AtomicBool>,
    subscription: JoinHandle<()>,
    publisher: JoinHandle<()>,
    last_executed: Arc<Mutex<Option<Instant>>>,
}

impl ActiveTask {
    /// Stop scheduling. An in-flight pipeline finishes; queued fires are discarded.
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.subscription.abort();
    }
}

/// Aborts the wrapped task when dropped; used so a forcibly stopped publisher
/// takes its in-flight pipeline with it
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub struct TaskManager {
    config: SchedulerConfig,
    pipeline: Arc<Pipeline>,
    lifecycle: Arc<Lifecycle>,
    counters: Arc<TaskCounters>,
    tasks: DashMap<Arc<Configuration>, ActiveTask>,
    next_task_id: AtomicU64,
    /// Run-once: configurations whose single fire has finished
    completed: DashSet<Arc<Configuration>>,
    run_once_armed: AtomicBool,
    run_once_done: AtomicBool,
    weak_self: Weak<TaskManager>,
}

impl std::fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskManager")
            .field("active_tasks", &self.tasks.len())
            .field("run_once", &self.config.run_once)
            .field("counters", &self.counters)
            .finish()
    }
}

impl TaskManager {
    pub fn new(
        config: &DaemonConfig,
        registry: Arc<ProcessorRegistry>,
        lifecycle: Arc<Lifecycle>,
    ) -> Arc<Self> {
        let counters = Arc::new(TaskCounters::default());
        let pipeline = Arc::new(Pipeline::new(registry, config, Arc::clone(&counters)));
        Arc::new_cyclic(|weak_self| Self {
            config: config.scheduler.clone(),
            pipeline,
            lifecycle,
            counters,
            tasks: DashMap::new(),
            next_task_id: AtomicU64::new(1),
            completed: DashSet::new(),
            run_once_armed: AtomicBool::new(false),
            run_once_done: AtomicBool::new(false),
            weak_self: weak_self.clone(),
        })
    }

    pub fn is_run_once(&self) -> bool {
        self.config.run_once
    }

    pub fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.lifecycle
    }

    /// Install the recurring pipeline for the wrapper's configuration,
    /// replacing any Active Task with an equal configuration. The new task is
    /// running before the old one is cancelled.
    #[instrument(skip_all, fields(configuration = %wrapper.configuration().fingerprint()))]
    pub fn upsert(&self, wrapper: Arc<ConfigurationWrapper>) -> Result<()> {
        let configuration = wrapper.configuration();
        let fingerprint = configuration.fingerprint();

        if self.lifecycle.is_shutting_down() {
            return Err(EtlError::Shutdown(format!("not scheduling {fingerprint}")));
        }
        if self.config.run_once {
            if self.run_once_done.load(Ordering::Acquire) {
                return Err(EtlError::InvalidState(format!(
                    "run-once already completed, refusing to schedule {fingerprint}"
                )));
            }
            if self.completed.contains(&configuration) {
                debug!("Configuration already ran in run-once mode, not rescheduling");
                return Ok(());
            }
        }

        let task = self.spawn_task(Arc::clone(&configuration), wrapper);
        let task_id = task.id;
        let replaced = self.tasks.insert(configuration, task);

        match replaced {
            Some(old) => {
                old.cancel();
                log_task_operation(
                    "upsert",
                    &fingerprint,
                    "replaced",
                    Some(&format!("task {} -> {task_id}", old.id)),
                );
            }
            None => log_task_operation("upsert", &fingerprint, "scheduled", None),
        }
        Ok(())
    }

    /// Cancel and forget the Active Task for `configuration`, including its
    /// last-executed bookkeeping. Returns whether a task existed.
    pub fn remove(&self, configuration: &Configuration) -> bool {
        let Some((_, task)) = self.tasks.remove(configuration) else {
            return false;
        };
        task.cancel();
        log_task_operation(
            "remove",
            &configuration.fingerprint(),
            "cancelled",
            Some(&format!("task {}", task.id)),
        );
        self.check_run_once_completion();
        true
    }

    pub fn contains(&self, configuration: &Configuration) -> bool {
        self.tasks.contains_key(configuration)
    }

    pub fn active_configurations(&self) -> Vec<Arc<Configuration>> {
        self.tasks.iter().map(|entry| Arc::clone(entry.key())).collect()
    }

    pub fn wrapper(&self, configuration: &Configuration) -> Option<Arc<ConfigurationWrapper>> {
        self.tasks
            .get(configuration)
            .map(|task| Arc::clone(&task.wrapper))
    }

    /// Deadline of the most recent fire produced for `configuration`
    pub fn last_executed(&self, configuration: &Configuration) -> Option<Instant> {
        self.tasks
            .get(configuration)
            .and_then(|task| *task.last_executed.lock())
    }

    pub fn stats(&self) -> TaskStats {
        self.counters.snapshot(self.tasks.len())
    }

    /// Run-once: from now on, completion is signalled as soon as every known
    /// configuration has finished its fire and nothing is processing.
    pub fn arm_run_once_completion(&self) {
        if !self.config.run_once {
            return;
        }
        self.run_once_armed.store(true, Ordering::Release);
        self.check_run_once_completion();
    }

    fn check_run_once_completion(&self) {
        if !self.config.run_once || !self.run_once_armed.load(Ordering::Acquire) {
            return;
        }
        if self.counters.processing() > 0 {
            return;
        }
        let all_finished = self
            .tasks
            .iter()
            .all(|entry| self.completed.contains(entry.key()));
        if !all_finished {
            return;
        }
        if self
            .run_once_done
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            info!(
                configurations = self.completed.len(),
                "SCHEDULER: All run-once configurations finished"
            );
            self.lifecycle.complete();
        }
    }

    fn mark_completed(&self, configuration: Arc<Configuration>) {
        self.completed.insert(configuration);
        self.check_run_once_completion();
    }

    /// Stop every task: producers are aborted at once, publishers get up to
    /// `timeout` to drain their in-flight pipeline before being aborted.
    /// Returns the number of publishers that had to be forced.
    pub async fn shutdown(&self, timeout: Duration) -> usize {
        self.lifecycle.request_shutdown();

        let keys = self.active_configurations();
        let mut publishers = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some((_, task)) = self.tasks.remove(&key) {
                task.cancel();
                publishers.push(task.publisher);
            }
        }
        info!(tasks = publishers.len(), "SCHEDULER: Shutting down active tasks");

        let drained = tokio::time::timeout(timeout, join_all(publishers.iter_mut())).await;
        if drained.is_ok() {
            info!("SCHEDULER: All tasks drained");
            return 0;
        }

        let forced = publishers.iter().filter(|handle| !handle.is_finished()).count();
        for handle in &publishers {
            handle.abort();
        }
        self.pipeline.pools().close();
        warn!(
            forced,
            timeout_ms = timeout.as_millis() as u64,
            "SCHEDULER: Forced shutdown of tasks that did not drain in time"
        );
        forced
    }

    fn spawn_task(&self, configuration: Arc<Configuration>, wrapper: Arc<ConfigurationWrapper>) -> ActiveTask {
        let id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
        let (fire_tx, fire_rx) = mpsc::channel(self.config.fire_buffer);
        let cancelled = Arc::new(AtomicBool::new(false));
        let last_executed = Arc::new(Mutex::new(None));

        let interval = configuration.repeat_interval();
        let jitter = timing::start_jitter(interval, self.config.start_jitter_coefficient);
        let first_delay = timing::initial_delay(interval, jitter, wrapper.last_run(), Utc::now());

        let subscription = tokio::spawn(produce_fires(FireSchedule {
            task_id: id,
            fingerprint: configuration.fingerprint(),
            interval,
            first_delay,
            run_once: self.config.run_once,
            fire_tx,
            last_executed: Arc::clone(&last_executed),
            lifecycle: Arc::clone(&self.lifecycle),
            counters: Arc::clone(&self.counters),
        }));

        let publisher = tokio::spawn(consume_fires(
            self.weak_self.clone(),
            id,
            configuration,
            Arc::clone(&wrapper),
            fire_rx,
            Arc::clone(&cancelled),
        ));

        debug!(task_id = id, first_delay_ms = first_delay.as_millis() as u64, "Spawned task");
        ActiveTask {
            id,
            wrapper,
            cancelled,
            subscription,
            publisher,
            last_executed,
        }
    }
}

struct FireSchedule {
    task_id: u64,
    fingerprint: String,
    interval: Duration,
    first_delay: Duration,
    run_once: bool,
    fire_tx: mpsc::Sender<Instant>,
    last_executed: Arc<Mutex<Option<Instant>>>,
    lifecycle: Arc<Lifecycle>,
    counters: Arc<TaskCounters>,
}

/// Producer half of an Active Task
async fn produce_fires(schedule: FireSchedule) {
    let mut deadline = Instant::now() + schedule.first_delay;
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {}
            _ = schedule.lifecycle.shutdown_requested() => break,
        }
        if schedule.lifecycle.is_shutting_down() {
            break;
        }

        *schedule.last_executed.lock() = Some(deadline);
        match schedule.fire_tx.try_send(deadline) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let dropped = schedule.counters.fire_dropped();
                warn!(
                    task_id = schedule.task_id,
                    configuration = %schedule.fingerprint,
                    dropped_total = dropped,
                    "Previous fire still running, dropping fire"
                );
            }
            Err(TrySendError::Closed(_)) => break,
        }

        if schedule.run_once {
            break;
        }
        deadline = timing::next_deadline(deadline, schedule.interval, Instant::now());
    }
    debug!(task_id = schedule.task_id, "Fire producer stopped");
}

/// Consumer half of an Active Task
async fn consume_fires(
    manager: Weak<TaskManager>,
    task_id: u64,
    configuration: Arc<Configuration>,
    wrapper: Arc<ConfigurationWrapper>,
    mut fire_rx: mpsc::Receiver<Instant>,
    cancelled: Arc<AtomicBool>,
) {
    let fingerprint = configuration.fingerprint();
    while let Some(deadline) = fire_rx.recv().await {
        let Some(owner) = manager.upgrade() else { break };
        if cancelled.load(Ordering::Acquire) || owner.lifecycle.is_shutting_down() {
            break;
        }

        let lag = Instant::now().saturating_duration_since(deadline);
        debug!(task_id, configuration = %fingerprint, lag_ms = lag.as_millis() as u64, "Fire");

        let run = tokio::spawn(run_pipeline(
            Arc::clone(&owner.pipeline),
            Arc::clone(&owner.counters),
            Arc::clone(&owner.lifecycle),
            Arc::clone(&wrapper),
        ));
        let guard = AbortOnDrop(run.abort_handle());
        let lifecycle = Arc::clone(&owner.lifecycle);
        let fatal_delay = owner.config.fatal_shutdown_delay();
        let run_once = owner.config.run_once;
        drop(owner);

        let panicked = match run.await {
            Ok(()) => false,
            Err(join_error) if join_error.is_panic() => {
                error!(task_id, configuration = %fingerprint, "Pipeline panicked");
                lifecycle.fatal(format!("pipeline for {fingerprint} panicked"), fatal_delay);
                true
            }
            Err(_) => {
                debug!(task_id, "Pipeline cancelled");
                false
            }
        };
        drop(guard);

        if run_once && !panicked {
            if let Some(owner) = manager.upgrade() {
                owner.mark_completed(Arc::clone(&configuration));
            }
            break;
        }
    }
    debug!(task_id, "Fire consumer stopped");
}

async fn run_pipeline(
    pipeline: Arc<Pipeline>,
    counters: Arc<TaskCounters>,
    lifecycle: Arc<Lifecycle>,
    wrapper: Arc<ConfigurationWrapper>,
) {
    let _processing = counters.start_processing();
    let configuration = wrapper.configuration();

    match pipeline.execute(&configuration).await {
        Ok(outcome) => {
            counters.fire_executed();
            wrapper.record_run(Utc::now());
            if outcome.load_failures > 0 {
                warn!(
                    configuration = %configuration.fingerprint(),
                    failures = outcome.load_failures,
                    "Pipeline finished with failed deliveries"
                );
            }
        }
        Err(e) if pipeline::is_expected_during_shutdown(&e, lifecycle.is_shutting_down()) => {
            debug!(error = %e, "Pipeline interrupted by shutdown");
        }
        Err(e) => {
            counters.pipeline_failure(&e);
            log_error(
                "scheduler",
                e.stage(),
                &e.to_string(),
                Some(&configuration.fingerprint()),
            );
        }
    }
}
