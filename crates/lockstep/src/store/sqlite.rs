//! SQLite store implementation.

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqliteConnection, SqlitePool, Transaction};
use time::OffsetDateTime;
use tracing::debug;
use uuid::Uuid;

use super::{
    DEFAULT_MAX_ATTEMPTS, FailureOutcome, LeaseTx, QueueStore, elapsed_millis, millis_to_duration,
};
use crate::error::Result;
use crate::event::{
    Completion, MachineEvents, MachineId, NewEvent, ProcessedEvent, ProcessedStatus,
    ProcessingEvent, QueuedEvent, QueuedStatus, ReclaimReport,
};
use crate::retry::RetryPolicy;

const QUEUED_COLUMNS: &str = "id, machine_id, event_type, payload, attempts, max_attempts, \
     created_at, status, scheduled_for";

const PROCESSING_COLUMNS: &str = "id, machine_id, event_type, payload, attempts, max_attempts, \
     created_at, locked_until, processing_started_at";

const PROCESSED_COLUMNS: &str = "id, machine_id, event_type, payload, attempts, max_attempts, \
     created_at, status, processed_at, processing_duration";

/// SQLite-backed store.
///
/// Mutual exclusion per machine is enforced twice: the scheduler only
/// selects machines without a processing row, and `processing_events` carries
/// a unique index on `machine_id`. Correctness depends on every move being a
/// single transaction with atomic multi-statement commit.
///
/// # Database Schema
///
/// | Table               | Purpose                                         |
/// |---------------------|-------------------------------------------------|
/// | `queued_events`     | Events waiting for their `scheduled_for` time   |
/// | `processing_events` | Leased events, at most one per machine          |
/// | `processed_events`  | Terminal audit log (`complete` / `failed`)      |
///
/// Apply the schema with [`SqliteStore::migrate`].
///
/// # Example
///
/// ```ignore
/// use lockstep::SqliteStore;
///
/// let store = SqliteStore::connect("sqlite://tenant.db").await?;
/// store.migrate().await?;
/// ```
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct QueuedRow {
    id: Uuid,
    machine_id: String,
    event_type: String,
    payload: String,
    attempts: i64,
    max_attempts: i64,
    created_at: i64,
    status: String,
    scheduled_for: i64,
}

#[derive(sqlx::FromRow)]
struct ProcessingRow {
    id: Uuid,
    machine_id: String,
    event_type: String,
    payload: String,
    attempts: i64,
    max_attempts: i64,
    created_at: i64,
    locked_until: i64,
    processing_started_at: i64,
}

#[derive(sqlx::FromRow)]
struct ProcessedRow {
    id: Uuid,
    machine_id: String,
    event_type: String,
    payload: String,
    attempts: i64,
    max_attempts: i64,
    created_at: i64,
    status: String,
    processed_at: i64,
    processing_duration: i64,
}

impl TryFrom<QueuedRow> for QueuedEvent {
    type Error = crate::Error;

    fn try_from(row: QueuedRow) -> Result<Self> {
        let status = QueuedStatus::try_from(row.status)
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
        Ok(QueuedEvent {
            id: row.id,
            machine_id: MachineId::from(row.machine_id),
            event_type: row.event_type,
            payload: serde_json::from_str(&row.payload)?,
            attempts: row.attempts as u32,
            max_attempts: row.max_attempts as u32,
            created_at: from_millis(row.created_at)?,
            status,
            scheduled_for: from_millis(row.scheduled_for)?,
        })
    }
}

impl TryFrom<ProcessingRow> for ProcessingEvent {
    type Error = crate::Error;

    fn try_from(row: ProcessingRow) -> Result<Self> {
        Ok(ProcessingEvent {
            id: row.id,
            machine_id: MachineId::from(row.machine_id),
            event_type: row.event_type,
            payload: serde_json::from_str(&row.payload)?,
            attempts: row.attempts as u32,
            max_attempts: row.max_attempts as u32,
            created_at: from_millis(row.created_at)?,
            locked_until: from_millis(row.locked_until)?,
            processing_started_at: from_millis(row.processing_started_at)?,
        })
    }
}

impl TryFrom<ProcessedRow> for ProcessedEvent {
    type Error = crate::Error;

    fn try_from(row: ProcessedRow) -> Result<Self> {
        let status = ProcessedStatus::try_from(row.status)
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
        Ok(ProcessedEvent {
            id: row.id,
            machine_id: MachineId::from(row.machine_id),
            event_type: row.event_type,
            payload: serde_json::from_str(&row.payload)?,
            attempts: row.attempts as u32,
            max_attempts: row.max_attempts as u32,
            created_at: from_millis(row.created_at)?,
            status,
            processed_at: from_millis(row.processed_at)?,
            processing_duration: row.processing_duration,
        })
    }
}

fn to_millis(at: OffsetDateTime) -> i64 {
    (at.unix_timestamp_nanos() / 1_000_000) as i64
}

fn from_millis(millis: i64) -> Result<OffsetDateTime> {
    Ok(OffsetDateTime::from_unix_timestamp_nanos(
        i128::from(millis) * 1_000_000,
    )?)
}

impl SqliteStore {
    /// Create a store from an existing connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if missing) the database at `url`.
    ///
    /// Uses WAL journaling, a 5 second busy timeout and a single pooled
    /// connection: SQLite admits one writer at a time, and one connection
    /// keeps the scheduler, reclaimer and completions of this process from
    /// failing each other's transactions with `SQLITE_BUSY`.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Ok(Self::new(pool))
    }

    /// Apply the embedded schema migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert a queued row for a failed attempt that still has retries left.
    async fn requeue(
        conn: &mut SqliteConnection,
        event: &ProcessingRow,
        attempts: u32,
        scheduled_for: OffsetDateTime,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO queued_events
                (id, machine_id, event_type, payload, attempts, max_attempts,
                 created_at, status, scheduled_for)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(event.id)
        .bind(&event.machine_id)
        .bind(&event.event_type)
        .bind(&event.payload)
        .bind(i64::from(attempts))
        .bind(event.max_attempts)
        .bind(event.created_at)
        .bind(QueuedStatus::Retrying.as_str())
        .bind(to_millis(scheduled_for))
        .execute(conn)
        .await?;

        Ok(())
    }

    /// Insert the terminal audit row for an event.
    async fn record_processed(
        conn: &mut SqliteConnection,
        event: &ProcessingRow,
        attempts: u32,
        status: ProcessedStatus,
        now: OffsetDateTime,
    ) -> Result<i64> {
        let started_at = from_millis(event.processing_started_at)?;
        let duration = elapsed_millis(started_at, now);

        sqlx::query(
            r#"
            INSERT INTO processed_events
                (id, machine_id, event_type, payload, attempts, max_attempts,
                 created_at, status, processed_at, processing_duration)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(event.id)
        .bind(&event.machine_id)
        .bind(&event.event_type)
        .bind(&event.payload)
        .bind(i64::from(attempts))
        .bind(event.max_attempts)
        .bind(event.created_at)
        .bind(status.as_str())
        .bind(to_millis(now))
        .bind(duration)
        .execute(conn)
        .await?;

        Ok(duration)
    }

    /// Route a failed attempt to the queued or processed table.
    async fn record_failure(
        conn: &mut SqliteConnection,
        event: &ProcessingRow,
        now: OffsetDateTime,
        retry: &RetryPolicy,
    ) -> Result<FailureOutcome> {
        let outcome = FailureOutcome::after_failure(
            event.attempts as u32,
            event.max_attempts as u32,
            now,
            retry,
        );

        match outcome {
            FailureOutcome::Requeue {
                attempts,
                scheduled_for,
            } => Self::requeue(conn, event, attempts, scheduled_for).await?,
            FailureOutcome::Fail { attempts } => {
                Self::record_processed(conn, event, attempts, ProcessedStatus::Failed, now)
                    .await?;
            }
        }

        Ok(outcome)
    }
}

impl QueueStore for SqliteStore {
    type LeaseTx = SqliteLeaseTx;

    async fn enqueue(&self, event: NewEvent, now: OffsetDateTime) -> Result<QueuedEvent> {
        let id = Uuid::now_v7();
        let max_attempts = event.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS);
        let scheduled_for = event.scheduled_for.unwrap_or(now);
        let payload = serde_json::to_string(&event.payload)?;

        sqlx::query(
            r#"
            INSERT INTO queued_events
                (id, machine_id, event_type, payload, attempts, max_attempts,
                 created_at, status, scheduled_for)
            VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(id)
        .bind(event.machine_id.as_str())
        .bind(&event.event_type)
        .bind(&payload)
        .bind(i64::from(max_attempts))
        .bind(to_millis(now))
        .bind(QueuedStatus::Queued.as_str())
        .bind(to_millis(scheduled_for))
        .execute(&self.pool)
        .await?;

        Ok(QueuedEvent {
            id,
            machine_id: event.machine_id,
            event_type: event.event_type,
            payload: event.payload,
            attempts: 0,
            max_attempts,
            created_at: from_millis(to_millis(now))?,
            status: QueuedStatus::Queued,
            scheduled_for: from_millis(to_millis(scheduled_for))?,
        })
    }

    async fn begin_lease(&self) -> Result<SqliteLeaseTx> {
        let tx = self.pool.begin().await?;
        Ok(SqliteLeaseTx { tx })
    }

    async fn finalize(
        &self,
        event_id: Uuid,
        success: bool,
        now: OffsetDateTime,
        retry: &RetryPolicy,
    ) -> Result<Completion> {
        let mut tx = self.pool.begin().await?;

        // Deleting first makes this a write transaction from its first
        // statement and makes a second completion of the same event miss.
        let row: Option<ProcessingRow> = sqlx::query_as(&format!(
            "DELETE FROM processing_events WHERE id = ?1 RETURNING {PROCESSING_COLUMNS}"
        ))
        .bind(event_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(event) = row else {
            return Err(crate::Error::NotFound(event_id));
        };

        let completion = if success {
            let duration = Self::record_processed(
                &mut tx,
                &event,
                event.attempts as u32,
                ProcessedStatus::Complete,
                now,
            )
            .await?;
            Completion::Completed {
                duration: millis_to_duration(duration),
            }
        } else {
            match Self::record_failure(&mut tx, &event, now, retry).await? {
                FailureOutcome::Requeue {
                    attempts,
                    scheduled_for,
                } => Completion::Retrying {
                    attempts,
                    scheduled_for: from_millis(to_millis(scheduled_for))?,
                },
                FailureOutcome::Fail { attempts } => Completion::Failed { attempts },
            }
        };

        tx.commit().await?;
        Ok(completion)
    }

    async fn reclaim_expired(
        &self,
        now: OffsetDateTime,
        retry: &RetryPolicy,
    ) -> Result<ReclaimReport> {
        let mut tx = self.pool.begin().await?;

        let expired: Vec<ProcessingRow> = sqlx::query_as(&format!(
            "DELETE FROM processing_events WHERE locked_until < ?1 RETURNING {PROCESSING_COLUMNS}"
        ))
        .bind(to_millis(now))
        .fetch_all(&mut *tx)
        .await?;

        let mut report = ReclaimReport::default();
        for event in &expired {
            match Self::record_failure(&mut tx, event, now, retry).await? {
                FailureOutcome::Requeue { attempts, .. } => {
                    debug!(event_id = %event.id, machine_id = %event.machine_id, attempts, "Lease expired, event re-queued");
                    report.requeued.push(event.id);
                }
                FailureOutcome::Fail { attempts } => {
                    debug!(event_id = %event.id, machine_id = %event.machine_id, attempts, "Lease expired, attempts exhausted");
                    report.failed.push(event.id);
                }
            }
        }

        tx.commit().await?;
        Ok(report)
    }

    async fn events_by_machine(&self, machine_id: &MachineId) -> Result<MachineEvents> {
        // One read transaction keeps the three selects on the same snapshot.
        let mut tx = self.pool.begin().await?;

        let queued: Vec<QueuedRow> = sqlx::query_as(&format!(
            "SELECT {QUEUED_COLUMNS} FROM queued_events WHERE machine_id = ?1 \
             ORDER BY created_at DESC, id DESC"
        ))
        .bind(machine_id.as_str())
        .fetch_all(&mut *tx)
        .await?;

        let processing: Vec<ProcessingRow> = sqlx::query_as(&format!(
            "SELECT {PROCESSING_COLUMNS} FROM processing_events WHERE machine_id = ?1 \
             ORDER BY created_at DESC, id DESC"
        ))
        .bind(machine_id.as_str())
        .fetch_all(&mut *tx)
        .await?;

        let processed: Vec<ProcessedRow> = sqlx::query_as(&format!(
            "SELECT {PROCESSED_COLUMNS} FROM processed_events WHERE machine_id = ?1 \
             ORDER BY processed_at DESC, id DESC"
        ))
        .bind(machine_id.as_str())
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(MachineEvents {
            queued: queued
                .into_iter()
                .map(QueuedEvent::try_from)
                .collect::<Result<_>>()?,
            processing: processing
                .into_iter()
                .map(ProcessingEvent::try_from)
                .collect::<Result<_>>()?,
            processed: processed
                .into_iter()
                .map(ProcessedEvent::try_from)
                .collect::<Result<_>>()?,
        })
    }
}

/// SQLite lease transaction.
///
/// Wraps a transaction that is rolled back on drop unless committed.
pub struct SqliteLeaseTx {
    tx: Transaction<'static, Sqlite>,
}

impl LeaseTx for SqliteLeaseTx {
    async fn fetch_due(&mut self, now: OffsetDateTime, limit: u32) -> Result<Vec<MachineId>> {
        let machines: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT q.machine_id
            FROM queued_events q
            WHERE q.scheduled_for <= ?1
              AND q.attempts <= q.max_attempts
              AND NOT EXISTS (
                  SELECT 1 FROM processing_events p WHERE p.machine_id = q.machine_id
              )
            GROUP BY q.machine_id
            ORDER BY MIN(q.created_at)
            LIMIT ?2
            "#,
        )
        .bind(to_millis(now))
        .bind(i64::from(limit))
        .fetch_all(&mut *self.tx)
        .await?;

        Ok(machines.into_iter().map(MachineId::from).collect())
    }

    async fn lock_oldest(
        &mut self,
        machine_id: &MachineId,
        now: OffsetDateTime,
        locked_until: OffsetDateTime,
    ) -> Result<Option<ProcessingEvent>> {
        let row: Option<QueuedRow> = sqlx::query_as(&format!(
            "SELECT {QUEUED_COLUMNS} FROM queued_events \
             WHERE machine_id = ?1 AND scheduled_for <= ?2 AND attempts <= max_attempts \
             ORDER BY created_at, id \
             LIMIT 1"
        ))
        .bind(machine_id.as_str())
        .bind(to_millis(now))
        .fetch_optional(&mut *self.tx)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let started_at = to_millis(now);
        let lease_end = to_millis(locked_until);

        sqlx::query(
            r#"
            INSERT INTO processing_events
                (id, machine_id, event_type, payload, attempts, max_attempts,
                 created_at, locked_until, processing_started_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
        )
        .bind(row.id)
        .bind(&row.machine_id)
        .bind(&row.event_type)
        .bind(&row.payload)
        .bind(row.attempts)
        .bind(row.max_attempts)
        .bind(row.created_at)
        .bind(lease_end)
        .bind(started_at)
        .execute(&mut *self.tx)
        .await?;

        sqlx::query("DELETE FROM queued_events WHERE id = ?1")
            .bind(row.id)
            .execute(&mut *self.tx)
            .await?;

        let event = ProcessingEvent::try_from(ProcessingRow {
            id: row.id,
            machine_id: row.machine_id,
            event_type: row.event_type,
            payload: row.payload,
            attempts: row.attempts,
            max_attempts: row.max_attempts,
            created_at: row.created_at,
            locked_until: lease_end,
            processing_started_at: started_at,
        })?;

        Ok(Some(event))
    }

    async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }
}
