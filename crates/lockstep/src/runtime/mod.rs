//! Runtime for leasing and dispatching events.
//!
//! - [`EventProcessor`] — Owns the store, the periodic loops and the dispatch stream
//! - [`LeaseScheduler`] — Locks due events, one per machine, and dispatches them
//! - [`LeaseReclaimer`] — Recycles leases whose consumer never completed
//! - [`EventStream`] — Subscriber handle on the dispatch stream
//! - [`EventProcessorConfig`] — Polling intervals, lease length, retry policy
//!
//! # Example
//!
//! ```ignore
//! use lockstep::{EventProcessor, EventProcessorConfig, SqliteStore};
//!
//! let processor = EventProcessor::new(store, EventProcessorConfig::default());
//! let events = processor.subscribe();
//! processor.start();
//!
//! // ... consume `events`, call `processor.complete(..)` ...
//!
//! processor.shutdown().await;
//! ```

mod config;
mod dispatch;
mod processor;
mod reclaimer;
mod scheduler;

pub use config::EventProcessorConfig;
pub use dispatch::EventStream;
pub use processor::EventProcessor;
pub use reclaimer::LeaseReclaimer;
pub use scheduler::LeaseScheduler;
