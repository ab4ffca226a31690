//! Event handler trait for consuming dispatched events.

use async_trait::async_trait;

use super::context::DeliveryContext;
use crate::event::ProcessingEvent;

/// Handler for dispatched events.
///
/// A [`Consumer`](crate::Consumer) calls the handler once per delivery and
/// completes the event with the outcome.
///
/// # Results
///
/// | Result   | Meaning                                                      |
/// |----------|--------------------------------------------------------------|
/// | `Ok(())` | Event moves to the processed table as `complete`             |
/// | `Err(_)` | Failure, re-queued with backoff until max attempts, then `failed` |
///
/// # Idempotency
///
/// Events have **at-least-once** delivery semantics. A handler that outlives
/// its lease sees the event again. Use
/// [`DeliveryContext::idempotency_key()`] to dedupe external side effects.
///
/// # Example
///
/// ```ignore
/// struct NodeRunner {
///     actors: ActorSystem,
/// }
///
/// #[async_trait]
/// impl EventHandler for NodeRunner {
///     type Error = anyhow::Error;
///
///     async fn handle(
///         &self,
///         event: &ProcessingEvent,
///         ctx: &DeliveryContext,
///     ) -> Result<(), Self::Error> {
///         let actor = self.actors.get(&event.machine_id).await?;
///         actor.send(&event.event_type, &event.payload, ctx.idempotency_key()).await?;
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    /// The error type returned by this handler.
    ///
    /// Only its `Display` output is used, for logging.
    type Error: std::fmt::Display + Send + 'static;

    /// Process one delivered event.
    async fn handle(
        &self,
        event: &ProcessingEvent,
        ctx: &DeliveryContext,
    ) -> Result<(), Self::Error>;
}
