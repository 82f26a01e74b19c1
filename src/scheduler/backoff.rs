//! # Polling Backoff
//!
//! Exponential backoff for transforms that wait on an external completion.
//! The first attempt runs after `initial_delay`; after attempt `n` (counting
//! from zero) the next one waits `backoff * 2^n`. No attempt starts after
//! `timeout` has elapsed, and running out of time yields `Ok(None)`.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::config::PollingConfig;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollingBackoff {
    pub initial_delay: Duration,
    pub backoff: Duration,
    pub timeout: Duration,
}

impl From<&PollingConfig> for PollingBackoff {
    fn from(config: &PollingConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            backoff: Duration::from_millis(config.backoff_ms),
            timeout: Duration::from_millis(config.timeout_ms),
        }
    }
}

impl PollingBackoff {
    pub fn new(initial_delay: Duration, backoff: Duration, timeout: Duration) -> Self {
        Self {
            initial_delay,
            backoff,
            timeout,
        }
    }

    /// Wait inserted after the zero-based attempt `attempt`
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.backoff
            .saturating_mul(2u32.checked_pow(attempt).unwrap_or(u32::MAX))
    }

    /// Offsets from the start at which attempts happen, never past the timeout
    pub fn schedule(&self) -> Vec<Duration> {
        let mut offsets = Vec::new();
        let mut offset = self.initial_delay;
        let mut attempt = 0;
        while offset <= self.timeout {
            offsets.push(offset);
            if self.backoff.is_zero() {
                break;
            }
            offset = offset.saturating_add(self.delay_after(attempt));
            attempt += 1;
        }
        offsets
    }

    /// Upper bound on attempts: `floor(log2((t - d) / b + 1)) + 1`
    pub fn max_attempts(&self) -> u32 {
        self.schedule().len() as u32
    }
}

/// Drive `attempt` under `policy` until it yields `Some` or time runs out
///
/// ```rust
/// use metrics_etl::scheduler::{poll_with_backoff, PollingBackoff};
/// use std::time::Duration;
///
/// # tokio_test::block_on(async {
/// let policy = PollingBackoff::new(
///     Duration::from_millis(1),
///     Duration::from_millis(1),
///     Duration::from_secs(1),
/// );
/// let ready = poll_with_backoff(policy, |attempt| async move {
///     Ok((attempt == 2).then_some("done"))
/// })
/// .await
/// .unwrap();
/// assert_eq!(ready, Some("done"));
/// # });
/// ```
pub async fn poll_with_backoff<F, Fut, T>(policy: PollingBackoff, mut attempt: F) -> Result<Option<T>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let started = Instant::now();
    let deadline = started + policy.timeout;

    let mut next = started + policy.initial_delay;
    let mut number = 0u32;
    loop {
        // an overrunning attempt pushes the real start past the nominal one
        if next.max(Instant::now()) > deadline {
            debug!(
                attempts = number,
                timeout_ms = policy.timeout.as_millis() as u64,
                "Polling timed out without a result"
            );
            return Ok(None);
        }
        tokio::time::sleep_until(next).await;

        match tokio::time::timeout_at(deadline, attempt(number)).await {
            Ok(result) => {
                if let Some(value) = result? {
                    return Ok(Some(value));
                }
            }
            Err(_) => {
                debug!(attempt = number, "Polling attempt still pending at timeout");
                return Ok(None);
            }
        }

        if policy.backoff.is_zero() {
            return Ok(None);
        }
        next += policy.delay_after(number);
        number += 1;
    }
}
