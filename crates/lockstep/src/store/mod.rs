//! Storage abstraction for the three event tables.
//!
//! An event lives in exactly one table at a time and moves between them with
//! a delete and an insert inside one transaction:
//!
//! ```text
//!  enqueue          lock (scheduler)            finalize / reclaim
//! ─────────▶ queued ────────────────▶ processing ───────────────────▶ processed
//!              ▲                          │
//!              └──────── retry ───────────┘
//! ```
//!
//! - [`QueueStore`] — producer, completion, reclaim and query operations
//! - [`LeaseTx`] — the scheduler's fetch-and-lock transaction
//! - [`SqliteStore`] — SQLite implementation (requires `sqlite` feature)

#[cfg(feature = "sqlite")]
mod sqlite;

use std::future::Future;
use std::time::Duration;

use time::OffsetDateTime;
use uuid::Uuid;

#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteLeaseTx, SqliteStore};

use crate::error::Result;
use crate::event::{
    Completion, MachineEvents, MachineId, NewEvent, ProcessingEvent, QueuedEvent, ReclaimReport,
};
use crate::retry::RetryPolicy;

/// Attempts stamped on an event when neither the caller nor the processor
/// supplies a limit.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Storage backend for the event queue.
///
/// Every mutating operation must run in a single transaction: an event is
/// never visible in zero or two tables. Implementations must also guarantee
/// that at most one processing row exists per machine.
///
/// Users typically go through [`EventProcessor`](crate::EventProcessor)
/// rather than calling the store directly.
///
/// # Implementations
///
/// - [`SqliteStore`] — SQLite via `sqlx` (requires `sqlite` feature)
pub trait QueueStore: Send + Sync + Clone + 'static {
    /// The scheduler transaction type returned by [`begin_lease`](Self::begin_lease).
    type LeaseTx: LeaseTx + Send;

    /// Insert a new event into the queued table.
    ///
    /// `scheduled_for` defaults to `now`. There is no uniqueness constraint on
    /// the machine: any number of events may queue for one machine.
    fn enqueue(
        &self,
        event: NewEvent,
        now: OffsetDateTime,
    ) -> impl Future<Output = Result<QueuedEvent>> + Send;

    /// Begin the scheduler's fetch-and-lock transaction.
    ///
    /// Dropping the returned transaction without committing rolls back every
    /// lock taken through it.
    fn begin_lease(&self) -> impl Future<Output = Result<Self::LeaseTx>> + Send;

    /// Finalize a processing event.
    ///
    /// On success the event moves to the processed table as `complete`. On
    /// failure it is re-queued with backoff while attempts remain, otherwise
    /// it moves to the processed table as `failed`.
    ///
    /// Returns [`Error::NotFound`](crate::Error::NotFound) if the event holds
    /// no lease (already reclaimed or already completed).
    fn finalize(
        &self,
        event_id: Uuid,
        success: bool,
        now: OffsetDateTime,
        retry: &RetryPolicy,
    ) -> impl Future<Output = Result<Completion>> + Send;

    /// Recycle every processing event whose lease expired before `now`.
    ///
    /// Each expiry counts as a failed attempt: the event is re-queued with
    /// backoff, or failed once its attempts are exhausted.
    fn reclaim_expired(
        &self,
        now: OffsetDateTime,
        retry: &RetryPolicy,
    ) -> impl Future<Output = Result<ReclaimReport>> + Send;

    /// Fetch every stored event for a machine across all three tables.
    fn events_by_machine(
        &self,
        machine_id: &MachineId,
    ) -> impl Future<Output = Result<MachineEvents>> + Send;
}

/// The scheduler's fetch-and-lock transaction.
///
/// Selection and insertion into the processing table happen inside the same
/// transaction, so a concurrent scheduler sees either the queued row or
/// nothing and can never lock the same event twice. Changes are only
/// persisted when [`commit`](Self::commit) is called.
pub trait LeaseTx: Send {
    /// Return up to `limit` distinct machines that have at least one due
    /// queued event and no event currently in processing.
    fn fetch_due(
        &mut self,
        now: OffsetDateTime,
        limit: u32,
    ) -> impl Future<Output = Result<Vec<MachineId>>> + Send;

    /// Move the oldest due queued event of `machine_id` into processing with
    /// a lease ending at `locked_until`.
    ///
    /// Returns `None` if the machine has no due event left.
    fn lock_oldest(
        &mut self,
        machine_id: &MachineId,
        now: OffsetDateTime,
        locked_until: OffsetDateTime,
    ) -> impl Future<Output = Result<Option<ProcessingEvent>>> + Send;

    /// Commit every lock taken in this transaction.
    fn commit(self) -> impl Future<Output = Result<()>> + Send;
}

/// Where a failed attempt sends an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailureOutcome {
    Requeue {
        attempts: u32,
        scheduled_for: OffsetDateTime,
    },
    Fail {
        attempts: u32,
    },
}

impl FailureOutcome {
    /// Count one more attempt and decide between retry and terminal failure.
    pub(crate) fn after_failure(
        attempts: u32,
        max_attempts: u32,
        now: OffsetDateTime,
        retry: &RetryPolicy,
    ) -> Self {
        let attempts = attempts.saturating_add(1);
        if RetryPolicy::should_retry(attempts, max_attempts) {
            FailureOutcome::Requeue {
                attempts,
                scheduled_for: retry.next_attempt_at(now, attempts),
            }
        } else {
            FailureOutcome::Fail { attempts }
        }
    }
}

/// Milliseconds between two instants, clamped at zero.
pub(crate) fn elapsed_millis(from: OffsetDateTime, to: OffsetDateTime) -> i64 {
    let elapsed = to - from;
    elapsed.whole_milliseconds().max(0) as i64
}

pub(crate) fn millis_to_duration(millis: i64) -> Duration {
    Duration::from_millis(millis.max(0) as u64)
}
