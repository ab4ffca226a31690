//! Delivery context with correlation and idempotency metadata.

use time::OffsetDateTime;
use uuid::Uuid;

use crate::event::{MachineId, ProcessingEvent};

/// Context provided to event handlers for each delivery.
///
/// # Idempotency
///
/// Delivery is at-least-once: an event whose lease expires before completion
/// is delivered again. Use [`idempotency_key()`](Self::idempotency_key) to
/// dedupe side effects. The key is stable across redeliveries of the same
/// event.
#[derive(Debug, Clone)]
pub struct DeliveryContext {
    /// Identifier of the delivered event (UUID v7).
    pub event_id: Uuid,

    /// The machine the event targets.
    pub machine_id: MachineId,

    /// Current attempt number (1-based).
    ///
    /// First delivery is attempt 1, first retry is attempt 2, etc.
    pub attempt: u32,

    /// When the event was first enqueued.
    pub created_at: OffsetDateTime,
}

impl DeliveryContext {
    pub fn new(
        event_id: Uuid,
        machine_id: MachineId,
        attempt: u32,
        created_at: OffsetDateTime,
    ) -> Self {
        Self {
            event_id,
            machine_id,
            attempt,
            created_at,
        }
    }

    pub(crate) fn for_event(event: &ProcessingEvent) -> Self {
        Self::new(
            event.id,
            event.machine_id.clone(),
            event.attempts.saturating_add(1),
            event.created_at,
        )
    }

    /// Key for deduplicating side effects.
    ///
    /// Format: `{machine_id}:{event_id}`
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}", self.machine_id, self.event_id)
    }

    /// Returns `true` if an earlier attempt failed or was abandoned.
    pub fn is_retry(&self) -> bool {
        self.attempt > 1
    }
}
