//! Dispatch stream: multicast delivery of locked events to subscribers.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::{Notify, broadcast};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::event::{MachineId, ProcessingEvent};

/// Fan-out channel owned by one processor.
///
/// The stream carries no delivery guarantee: durability lives in the store.
/// An event sent while nobody listens stays leased until the reclaimer
/// recovers it. Events that did reach a subscriber are tracked until they are
/// completed or reclaimed so shutdown can wait for them. Tracking counts
/// dispatches, since a retried event can be dispatched again under the same id
/// before its previous completion is released.
pub(crate) struct DispatchStream {
    sender: Mutex<Option<broadcast::Sender<ProcessingEvent>>>,
    in_flight: Mutex<HashMap<Uuid, usize>>,
    drained: Notify,
}

impl DispatchStream {
    pub(crate) fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Mutex::new(Some(sender)),
            in_flight: Mutex::new(HashMap::new()),
            drained: Notify::new(),
        }
    }

    /// Attach a new subscriber. After [`close`](Self::close) the returned
    /// stream is already finished.
    pub(crate) fn subscribe(&self) -> EventStream {
        let guard = self.sender.lock().unwrap_or_else(|e| e.into_inner());
        let receiver = match guard.as_ref() {
            Some(sender) => sender.subscribe(),
            None => {
                let (closed, receiver) = broadcast::channel(1);
                drop(closed);
                receiver
            }
        };
        EventStream { receiver }
    }

    /// Publish one tick's batch, grouped by machine.
    ///
    /// Returns the number of events that reached at least one subscriber.
    pub(crate) fn publish(&self, batch: Vec<ProcessingEvent>) -> usize {
        let mut groups: BTreeMap<MachineId, Vec<ProcessingEvent>> = BTreeMap::new();
        for event in batch {
            groups.entry(event.machine_id.clone()).or_default().push(event);
        }

        let guard = self.sender.lock().unwrap_or_else(|e| e.into_inner());
        let Some(sender) = guard.as_ref() else {
            return 0;
        };

        let mut delivered = 0;
        for (machine_id, events) in groups {
            for event in events {
                let event_id = event.id;
                // Track before sending so a fast completion cannot race the insert.
                self.track(event_id);
                match sender.send(event) {
                    Ok(receivers) => {
                        debug!(%event_id, %machine_id, receivers, "Event dispatched");
                        delivered += 1;
                    }
                    Err(_) => {
                        self.release(event_id);
                        debug!(
                            %event_id,
                            %machine_id,
                            "No subscribers, event stays leased until reclaimed"
                        );
                    }
                }
            }
        }

        delivered
    }

    fn track(&self, event_id: Uuid) {
        *self
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(event_id)
            .or_default() += 1;
    }

    /// Stop waiting for an event: it was completed or its lease was reclaimed.
    pub(crate) fn release(&self, event_id: Uuid) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        let Some(count) = in_flight.get_mut(&event_id) else {
            return;
        };
        *count -= 1;
        if *count == 0 {
            in_flight.remove(&event_id);
            if in_flight.is_empty() {
                self.drained.notify_waiters();
            }
        }
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Wait until every dispatched event has been released.
    ///
    /// Returns `false` if `timeout` elapsed first.
    pub(crate) async fn wait_drained(&self, timeout: Duration) -> bool {
        let drained = async {
            loop {
                let notified = self.drained.notified();
                if self.in_flight() == 0 {
                    return;
                }
                notified.await;
            }
        };

        tokio::time::timeout(timeout, drained).await.is_ok()
    }

    /// Close the stream. Subscribers finish after draining buffered events.
    ///
    /// Returns `false` if the stream was already closed.
    pub(crate) fn close(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .is_some()
    }
}

/// Subscriber handle yielding dispatched events.
///
/// Every subscriber receives every dispatched event. Per-machine delivery
/// never overlaps: a machine's next event is not locked until the previous
/// one is completed or reclaimed.
///
/// # Example
///
/// ```ignore
/// let mut events = processor.subscribe();
/// while let Some(event) = events.recv().await {
///     let ok = run_node(&event).await.is_ok();
///     processor.complete(event.id, ok).await;
/// }
/// ```
pub struct EventStream {
    receiver: broadcast::Receiver<ProcessingEvent>,
}

impl EventStream {
    /// Receive the next dispatched event.
    ///
    /// Returns `None` once the processor has shut down and buffered events
    /// are drained. A subscriber that falls more than the dispatch capacity
    /// behind skips ahead; the skipped events stay leased and are recovered
    /// by the reclaimer.
    pub async fn recv(&mut self) -> Option<ProcessingEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Subscriber lagged behind the dispatch stream");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
