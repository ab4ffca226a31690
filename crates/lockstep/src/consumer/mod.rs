//! Consumer side of the dispatch stream.
//!
//! - [`Consumer`] — Runs a handler per event, one at a time per machine
//! - [`EventHandler`] — Trait implemented by the code doing the work
//! - [`DeliveryContext`] — Attempt and idempotency metadata per delivery

mod context;
mod handler;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

pub use context::DeliveryContext;
pub use handler::EventHandler;

use crate::event::{MachineId, ProcessingEvent};
use crate::runtime::{EventProcessor, EventStream};
use crate::store::QueueStore;

type Lanes = Arc<Mutex<HashMap<MachineId, VecDeque<ProcessingEvent>>>>;

/// Runs an [`EventHandler`] against a processor's dispatch stream.
///
/// Events are grouped into one lane per machine. A lane handles its events
/// sequentially, and at most `max_concurrent_machines` lanes run a handler
/// at the same time. Every delivery ends in
/// [`EventProcessor::complete`] with the handler's outcome.
///
/// The consumer subscribes when it is created, so create it before starting
/// the processor to see the first tick.
///
/// # Example
///
/// ```ignore
/// let processor = EventProcessor::new(store, EventProcessorConfig::default());
/// let consumer = Consumer::new(processor.clone(), NodeRunner::new()).spawn();
/// processor.start();
///
/// // ...
///
/// processor.shutdown().await;
/// consumer.await?;
/// ```
pub struct Consumer<S: QueueStore, H: EventHandler> {
    processor: EventProcessor<S>,
    handler: Arc<H>,
    events: EventStream,
    permits: Arc<Semaphore>,
    lanes: Lanes,
}

impl<S: QueueStore, H: EventHandler> Consumer<S, H> {
    pub fn new(processor: EventProcessor<S>, handler: H) -> Self {
        let events = processor.subscribe();
        let permits = Arc::new(Semaphore::new(
            processor.config().max_concurrent_machines.max(1),
        ));
        Self {
            processor,
            handler: Arc::new(handler),
            events,
            permits,
            lanes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run on a background task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Consume until the processor shuts down, then finish every lane.
    pub async fn run(mut self) {
        let mut tasks = JoinSet::new();
        info!("Consumer started");

        loop {
            tokio::select! {
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Consumer lane panicked");
                    }
                }
                event = self.events.recv() => match event {
                    Some(event) => self.route(event, &mut tasks),
                    None => break,
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Consumer lane panicked");
            }
        }

        info!("Consumer stopped");
    }

    /// Append to the machine's lane, starting the lane if it is idle.
    fn route(&self, event: ProcessingEvent, tasks: &mut JoinSet<()>) {
        let machine_id = event.machine_id.clone();
        {
            let mut lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(lane) = lanes.get_mut(&machine_id) {
                debug!(event_id = %event.id, %machine_id, "Machine busy, event waits in lane");
                lane.push_back(event);
                return;
            }
            lanes.insert(machine_id.clone(), VecDeque::from([event]));
        }

        let lane = Lane {
            machine_id,
            processor: self.processor.clone(),
            handler: Arc::clone(&self.handler),
            permits: Arc::clone(&self.permits),
            lanes: Arc::clone(&self.lanes),
        };
        tasks.spawn(lane.run());
    }
}

/// Sequential worker for one machine.
struct Lane<S: QueueStore, H: EventHandler> {
    machine_id: MachineId,
    processor: EventProcessor<S>,
    handler: Arc<H>,
    permits: Arc<Semaphore>,
    lanes: Lanes,
}

impl<S: QueueStore, H: EventHandler> Lane<S, H> {
    async fn run(self) {
        let mut guard = LaneGuard {
            machine_id: &self.machine_id,
            lanes: &self.lanes,
            armed: true,
        };

        loop {
            let next = {
                let mut lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
                let next = lanes
                    .get_mut(&self.machine_id)
                    .and_then(|lane| lane.pop_front());
                if next.is_none() {
                    lanes.remove(&self.machine_id);
                }
                next
            };

            let Some(event) = next else {
                guard.armed = false;
                return;
            };

            let Ok(_permit) = Arc::clone(&self.permits).acquire_owned().await else {
                return;
            };
            self.deliver(event).await;
        }
    }

    async fn deliver(&self, event: ProcessingEvent) {
        let ctx = DeliveryContext::for_event(&event);
        debug!(
            event_id = %event.id,
            machine_id = %event.machine_id,
            attempt = ctx.attempt,
            "Handling event"
        );

        let success = match self.handler.handle(&event, &ctx).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    event_id = %event.id,
                    machine_id = %event.machine_id,
                    attempt = ctx.attempt,
                    error = %e,
                    "Event handler failed"
                );
                false
            }
        };

        self.processor.complete(event.id, success).await;
    }
}

/// Drops a lane whose task ends abnormally so the machine can start a new one.
///
/// Events still waiting in that lane keep their leases and come back through
/// the reclaimer.
struct LaneGuard<'a> {
    machine_id: &'a MachineId,
    lanes: &'a Lanes,
    armed: bool,
}

impl Drop for LaneGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.lanes
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(self.machine_id);
        }
    }
}
