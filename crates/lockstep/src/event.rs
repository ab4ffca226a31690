//! Event records and their three lifecycle representations.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Identifier of the actor (workflow node or execution) an event targets.
///
/// A machine is the unit of ordering: its events are delivered one at a time
/// in creation order.
///
/// # Example
///
/// ```
/// use lockstep::MachineId;
///
/// let id = MachineId::new("node-42");
/// assert_eq!(id.as_str(), "node-42");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MachineId(String);

impl MachineId {
    /// Create a new machine ID.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Consume the wrapper and return the inner string.
    pub fn into_inner(self) -> String {
        self.0
    }

    /// Borrow the ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl From<String> for MachineId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for MachineId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// A status string read back from storage did not match any known state.
#[derive(Debug, Error)]
#[error("unknown event status: {0}")]
pub struct UnknownStatus(pub String);

/// Status of a row in the queued table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuedStatus {
    /// Enqueued by a producer, never attempted.
    Queued,
    /// Re-queued after a failed attempt or an expired lease.
    Retrying,
}

impl QueuedStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Retrying => "retrying",
        }
    }
}

impl TryFrom<String> for QueuedStatus {
    type Error = UnknownStatus;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        match value.as_str() {
            "queued" => Ok(Self::Queued),
            "retrying" => Ok(Self::Retrying),
            _ => Err(UnknownStatus(value)),
        }
    }
}

/// Terminal status of a row in the processed table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessedStatus {
    Complete,
    Failed,
}

impl ProcessedStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }
}

impl TryFrom<String> for ProcessedStatus {
    type Error = UnknownStatus;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        match value.as_str() {
            "complete" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed),
            _ => Err(UnknownStatus(value)),
        }
    }
}

/// Producer input for [`EventProcessor::enqueue`](crate::EventProcessor::enqueue).
///
/// # Example
///
/// ```
/// use lockstep::NewEvent;
/// use serde_json::json;
///
/// let event = NewEvent::new("node-1", "RUN", json!({ "input": 1 })).max_attempts(5);
/// assert_eq!(event.max_attempts, Some(5));
/// ```
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub machine_id: MachineId,
    pub event_type: String,
    pub payload: Value,
    /// Earliest dispatch time. Defaults to the enqueue time.
    pub scheduled_for: Option<OffsetDateTime>,
    /// Defaults to the processor's [`RetryPolicy::max_attempts`](crate::RetryPolicy).
    pub max_attempts: Option<u32>,
}

impl NewEvent {
    /// Create an event with an already-encoded JSON payload.
    pub fn new(
        machine_id: impl Into<MachineId>,
        event_type: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            machine_id: machine_id.into(),
            event_type: event_type.into(),
            payload,
            scheduled_for: None,
            max_attempts: None,
        }
    }

    /// Create an event from any serializable payload.
    ///
    /// Fails with [`Error::Validation`] if the payload cannot be represented
    /// as JSON.
    pub fn from_serializable<T: Serialize + ?Sized>(
        machine_id: impl Into<MachineId>,
        event_type: impl Into<String>,
        payload: &T,
    ) -> Result<Self> {
        let payload = serde_json::to_value(payload)
            .map_err(|e| Error::validation(format!("payload is not valid JSON: {e}")))?;
        Ok(Self::new(machine_id, event_type, payload))
    }

    /// Delay dispatch until `at`.
    pub fn scheduled_for(mut self, at: OffsetDateTime) -> Self {
        self.scheduled_for = Some(at);
        self
    }

    /// Override the number of attempts before the event is failed.
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.machine_id.as_str().trim().is_empty() {
            return Err(Error::validation("machine id must not be empty"));
        }
        if self.event_type.trim().is_empty() {
            return Err(Error::validation("event type must not be empty"));
        }
        if self.payload.is_null() {
            return Err(Error::validation("payload must not be null"));
        }
        if self.max_attempts == Some(0) {
            return Err(Error::validation("max attempts must be at least 1"));
        }
        Ok(())
    }
}

/// An event waiting in the queued table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedEvent {
    pub id: Uuid,
    pub machine_id: MachineId,
    pub event_type: String,
    pub payload: Value,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: OffsetDateTime,
    pub status: QueuedStatus,
    pub scheduled_for: OffsetDateTime,
}

/// An event holding a lease in the processing table.
///
/// This is also what the dispatch stream delivers to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingEvent {
    pub id: Uuid,
    pub machine_id: MachineId,
    pub event_type: String,
    pub payload: Value,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: OffsetDateTime,
    /// Lease expiry. The reclaimer recycles the event once this passes.
    pub locked_until: OffsetDateTime,
    pub processing_started_at: OffsetDateTime,
}

/// Immutable audit record of a finished event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedEvent {
    pub id: Uuid,
    pub machine_id: MachineId,
    pub event_type: String,
    pub payload: Value,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: OffsetDateTime,
    pub status: ProcessedStatus,
    pub processed_at: OffsetDateTime,
    /// Milliseconds between the final lock and `processed_at`.
    pub processing_duration: i64,
}

/// Every stored event for one machine, grouped by lifecycle table.
#[derive(Debug, Clone, Default)]
pub struct MachineEvents {
    /// Newest first by creation time.
    pub queued: Vec<QueuedEvent>,
    /// At most one entry.
    pub processing: Vec<ProcessingEvent>,
    /// Newest first by completion time.
    pub processed: Vec<ProcessedEvent>,
}

/// What a completion did to the event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// Moved to the processed table with status `complete`.
    Completed { duration: Duration },
    /// Moved back to the queued table for another attempt.
    Retrying {
        attempts: u32,
        scheduled_for: OffsetDateTime,
    },
    /// Attempts exhausted; moved to the processed table with status `failed`.
    Failed { attempts: u32 },
}

/// Outcome of one stale-lease sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    /// Events moved back to the queued table.
    pub requeued: Vec<Uuid>,
    /// Events whose attempts were exhausted.
    pub failed: Vec<Uuid>,
}

impl ReclaimReport {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.failed.is_empty()
    }

    /// Every event the sweep took out of the processing table.
    pub fn reclaimed(&self) -> impl Iterator<Item = Uuid> + '_ {
        self.requeued.iter().chain(self.failed.iter()).copied()
    }
}
