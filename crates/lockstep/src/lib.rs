//! Durable per-machine event queue on plain relational tables.
//!
//! Lockstep delivers events to long-lived "machine" actors (workflow nodes,
//! executions) with these guarantees:
//!
//! - **One in flight per machine** — a machine's events are delivered one at a
//!   time in creation order
//! - **Crash recovery** — leases abandoned by dead consumers are reclaimed
//! - **Bounded concurrency** — at most `max_concurrent_machines` machines are
//!   leased per tick
//! - **Bounded retries** — failures are re-queued with backoff until
//!   `max_attempts`, then recorded as `failed`
//!
//! Delivery is at-least-once; consumers dedupe with
//! [`DeliveryContext::idempotency_key`].
//!
//! # Architecture
//!
//! ```text
//!  producer ──enqueue──▶ ┌──────────────────────────────────────────────┐
//!                        │  queued_events ─▶ processing_events ─▶ processed_events
//!                        └──────▲──────────────────┬───────────────────┘
//!                               │                  │
//!        LeaseReclaimer ────────┘    LeaseScheduler│ (fetch + lock, one tx)
//!        (expired leases)                          ▼
//!                                           dispatch stream ──▶ subscribers
//!                                                                    │
//!  EventProcessor::complete(event_id, success) ◀─────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use lockstep::{EventProcessor, EventProcessorConfig, NewEvent, SqliteStore};
//! use serde_json::json;
//!
//! let store = SqliteStore::connect("sqlite://tenant.db").await?;
//! store.migrate().await?;
//!
//! let processor = EventProcessor::new(store, EventProcessorConfig::default());
//! let consumer = Consumer::new(processor.clone(), NodeRunner::new()).spawn();
//! processor.start();
//!
//! processor
//!     .enqueue(NewEvent::new("node-1", "RUN", json!({ "input": 42 })))
//!     .await?;
//!
//! // ...
//! processor.shutdown().await;
//! consumer.await?;
//! ```
//!
//! # Feature Flags
//!
//! - `sqlite` (default) — Enables [`SqliteStore`]

mod consumer;
mod error;
mod event;
mod retry;
pub mod runtime;
pub mod store;

pub use consumer::{Consumer, DeliveryContext, EventHandler};
pub use error::{Error, Result};
pub use event::{
    Completion, MachineEvents, MachineId, NewEvent, ProcessedEvent, ProcessedStatus,
    ProcessingEvent, QueuedEvent, QueuedStatus, ReclaimReport, UnknownStatus,
};
pub use retry::{Backoff, RetryPolicy};
pub use runtime::{
    EventProcessor, EventProcessorConfig, EventStream, LeaseReclaimer, LeaseScheduler,
};
#[cfg(feature = "sqlite")]
pub use store::SqliteStore;
pub use store::{LeaseTx, QueueStore};
