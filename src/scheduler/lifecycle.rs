//! # Process Lifecycle
//!
//! Shared shutdown flag and completion signal. Every loop in the daemon checks
//! [`Lifecycle::is_shutting_down`] before starting new work and selects on
//! [`Lifecycle::shutdown_requested`] while idle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tracing::{error, info, warn};

/// Terminal state reported to whoever waits on the daemon
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Running,
    Completed,
    Failed(String),
}

impl Completion {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

#[derive(Debug)]
pub struct Lifecycle {
    shutting_down: AtomicBool,
    shutdown_notify: Notify,
    completion: watch::Sender<Completion>,
}

impl Lifecycle {
    pub fn new() -> Arc<Self> {
        let (completion, _) = watch::channel(Completion::Running);
        Arc::new(Self {
            shutting_down: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
            completion,
        })
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Set the shutdown flag and wake every loop waiting on it. Idempotent.
    pub fn request_shutdown(&self) {
        if !self.shutting_down.swap(true, Ordering::AcqRel) {
            info!("LIFECYCLE: Shutdown requested");
        }
        self.shutdown_notify.notify_waiters();
    }

    /// Resolves once shutdown has been requested, including before this call
    pub async fn shutdown_requested(&self) {
        let notified = self.shutdown_notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_shutting_down() {
            return;
        }
        notified.await;
    }

    /// Signal that all work is done. Only the first terminal signal sticks.
    pub fn complete(&self) {
        if self.transition(Completion::Completed) {
            info!("LIFECYCLE: Completion signalled");
        }
    }

    pub fn fail(&self, reason: impl Into<String>) {
        let reason = reason.into();
        if self.transition(Completion::Failed(reason.clone())) {
            error!(reason = %reason, "LIFECYCLE: Failure signalled");
        }
    }

    /// Schedule a failure signal after `delay` so in-flight logging and
    /// cleanup can finish before the process exits.
    pub fn fatal(self: &Arc<Self>, reason: impl Into<String>, delay: Duration) {
        let reason = reason.into();
        warn!(reason = %reason, delay_ms = delay.as_millis() as u64, "LIFECYCLE: Fatal error, scheduling shutdown");
        let lifecycle = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            lifecycle.fail(reason);
        });
    }

    pub fn completion(&self) -> Completion {
        self.completion.borrow().clone()
    }

    /// Wait until the daemon completes or fails
    pub async fn wait_for_completion(&self) -> Completion {
        let mut receiver = self.completion.subscribe();
        let state = match receiver.wait_for(Completion::is_terminal).await {
            Ok(state) => state.clone(),
            Err(_) => self.completion(),
        };
        state
    }

    pub fn handle(self: &Arc<Self>) -> ShutdownHandle {
        ShutdownHandle {
            lifecycle: Arc::clone(self),
        }
    }

    fn transition(&self, next: Completion) -> bool {
        self.completion.send_if_modified(|state| {
            if state.is_terminal() {
                false
            } else {
                *state = next;
                true
            }
        })
    }
}

/// Cloneable handle that lets embedders stop a running daemon
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    lifecycle: Arc<Lifecycle>,
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        self.lifecycle.request_shutdown();
    }

    pub fn is_triggered(&self) -> bool {
        self.lifecycle.is_shutting_down()
    }
}
