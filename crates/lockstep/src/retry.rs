//! Retry policy for failed attempts and expired leases.

use std::time::Duration;

use time::OffsetDateTime;

/// Delay applied to `scheduled_for` when an event is re-queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// The same delay after every failure.
    Fixed(Duration),
    /// `base * 2^(attempt-1)`, capped at `max`.
    Exponential { base: Duration, max: Duration },
}

/// Configuration for retry behavior.
///
/// Each failed completion and each expired lease counts as one attempt.
/// Once an event has used `max_attempts` attempts it is written to the
/// processed table as `failed` and never re-queued.
///
/// # Backoff
///
/// The default is a fixed five minute delay. [`Backoff::Exponential`] is
/// available for consumers whose failures are mostly transient.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use lockstep::{Backoff, RetryPolicy};
///
/// let policy = RetryPolicy::default();
/// assert_eq!(policy.max_attempts, 3);
///
/// let quick = RetryPolicy {
///     max_attempts: 5,
///     backoff: Backoff::Exponential {
///         base: Duration::from_secs(1),
///         max: Duration::from_secs(60),
///     },
/// };
/// assert_eq!(quick.backoff_duration(3), Duration::from_secs(4));
/// ```
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts stamped on events enqueued without an explicit limit.
    ///
    /// Includes the initial attempt. Default: 3.
    pub max_attempts: u32,

    /// Delay before a re-queued event becomes eligible again.
    ///
    /// Default: fixed 5 minutes.
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Fixed(Duration::from_secs(300)),
        }
    }
}

impl RetryPolicy {
    /// Calculate the backoff duration after a failed attempt.
    ///
    /// # Arguments
    ///
    /// * `attempt` - The attempt number that just failed (1-based)
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { base, max } => {
                let multiplier = 2u32.saturating_pow(attempt.saturating_sub(1));
                base.saturating_mul(multiplier).min(max)
            }
        }
    }

    /// Calculate when a re-queued event becomes eligible again.
    pub fn next_attempt_at(&self, now: OffsetDateTime, attempt: u32) -> OffsetDateTime {
        let delay = self.backoff_duration(attempt);
        now + time::Duration::new(delay.as_secs() as i64, delay.subsec_nanos() as i32)
    }

    /// Returns `true` if an event that has now used `attempts` attempts
    /// out of `max_attempts` should be re-queued.
    pub fn should_retry(attempts: u32, max_attempts: u32) -> bool {
        attempts < max_attempts
    }
}
