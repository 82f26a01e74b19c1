//! Fire-time arithmetic: jittered start and drift-corrected intervals.

use chrono::{DateTime, Utc};
use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;

/// Random start delay in `[0, coefficient * interval)`
pub fn start_jitter(interval: Duration, coefficient: f64) -> Duration {
    let sample = rand::thread_rng().gen_range(0.0..1.0);
    scaled_jitter(sample, interval, coefficient)
}

/// Jitter for a given uniform sample in `[0, 1)`
pub fn scaled_jitter(sample: f64, interval: Duration, coefficient: f64) -> Duration {
    let factor = (sample * coefficient).clamp(0.0, 1.0);
    interval.mul_f64(factor)
}

/// Delay before the first fire of a task.
///
/// A configuration that already ran (same identity, reloaded) waits out the
/// remainder of its interval; the jitter is a lower bound either way.
pub fn initial_delay(
    interval: Duration,
    jitter: Duration,
    last_run: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Duration {
    let remaining = last_run
        .and_then(|last| {
            let due = last + chrono::Duration::from_std(interval).ok()?;
            (due - now).to_std().ok()
        })
        .unwrap_or(Duration::ZERO);
    jitter.max(remaining)
}

/// Next deadline after a fire at `last_executed`, clamped to `now` if already past
pub fn next_deadline(last_executed: Instant, interval: Duration, now: Instant) -> Instant {
    (last_executed + interval).max(now)
}
