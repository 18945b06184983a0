//! Connect backoff schedule.
//!
//! Exponential backoff with an upper bound and optional jitter, driven one
//! failed attempt at a time by the connection task.

use std::time::Duration;

use rand::Rng;

use crate::config::RetryPolicy;

/// Backoff state for one connection.
#[derive(Debug, Clone)]
pub(crate) struct Backoff {
    policy: RetryPolicy,
    /// Failed attempts since the last success.
    attempt: u32,
    next: Duration,
}

impl Backoff {
    pub(crate) fn new(policy: RetryPolicy) -> Self {
        let next = policy.min_timeout;
        Backoff {
            policy,
            attempt: 0,
            next,
        }
    }

    /// Failed attempts recorded since the last reset.
    pub(crate) fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Records a failed attempt and returns the delay before the next one,
    /// or `None` once the retry budget is spent.
    pub(crate) fn next_delay(&mut self) -> Option<Duration> {
        self.attempt = self.attempt.saturating_add(1);
        if let Some(retries) = self.policy.retries {
            if self.attempt > retries {
                return None;
            }
        }

        let delay = self.next.min(self.policy.max_timeout);
        self.next = std::cmp::min(
            Duration::from_nanos((delay.as_nanos() as f64 * self.policy.factor) as u64),
            self.policy.max_timeout,
        );
        Some(apply_jitter(delay, self.policy.jitter))
    }

    pub(crate) fn reset(&mut self) {
        self.attempt = 0;
        self.next = self.policy.min_timeout;
    }
}

/// Spreads `dur` uniformly over `[dur * (1 - factor), dur * (1 + factor)]`.
fn apply_jitter(dur: Duration, factor: f64) -> Duration {
    if factor <= 0.0 || dur.is_zero() {
        return dur;
    }

    let factor = factor.clamp(0.0, 1.0);
    let base = dur.as_nanos() as f64;
    let jittered = rand::rng().random_range(base * (1.0 - factor)..=base * (1.0 + factor));
    Duration::from_nanos(jittered as u64)
}
