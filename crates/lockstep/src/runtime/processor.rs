//! Event processor: owns the store, the periodic loops and the dispatch stream.

use std::sync::{Arc, Mutex};

use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::EventProcessorConfig;
use super::dispatch::{DispatchStream, EventStream};
use super::reclaimer::LeaseReclaimer;
use super::scheduler::LeaseScheduler;
use crate::error::{Error, Result};
use crate::event::{Completion, MachineEvents, MachineId, NewEvent, QueuedEvent};
use crate::store::QueueStore;

enum State {
    Idle,
    Running {
        shutdown_tx: watch::Sender<bool>,
        workers: Vec<JoinHandle<()>>,
    },
    Stopped,
}

struct Inner<S: QueueStore> {
    store: S,
    config: EventProcessorConfig,
    dispatch: Arc<DispatchStream>,
    state: Mutex<State>,
}

/// Durable per-machine event queue.
///
/// Producers [`enqueue`](Self::enqueue) events; the scheduler leases due
/// events (at most one per machine) and pushes them to every
/// [`subscribe`](Self::subscribe)r; consumers report back through
/// [`complete`](Self::complete). The reclaimer recycles leases whose consumer
/// never answered. Delivery is at-least-once.
///
/// The handle is cheap to clone; clones share the same loops and stream.
///
/// # Lifecycle
///
/// 1. Create with [`EventProcessor::new`]
/// 2. Subscribe consumers with [`EventProcessor::subscribe`]
/// 3. Start the loops with [`EventProcessor::start`]
/// 4. Stop with [`EventProcessor::shutdown`]
///
/// # Example
///
/// ```ignore
/// let store = SqliteStore::connect("sqlite://tenant.db").await?;
/// store.migrate().await?;
///
/// let processor = EventProcessor::new(store, EventProcessorConfig::default());
/// let mut events = processor.subscribe();
/// processor.start();
///
/// processor.enqueue(NewEvent::new("node-1", "RUN", json!({}))).await?;
///
/// while let Some(event) = events.recv().await {
///     let ok = run_node(&event).await.is_ok();
///     processor.complete(event.id, ok).await;
/// }
/// ```
pub struct EventProcessor<S: QueueStore> {
    inner: Arc<Inner<S>>,
}

impl<S: QueueStore> Clone for EventProcessor<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: QueueStore> EventProcessor<S> {
    /// Create a processor. No loop runs until [`start`](Self::start).
    pub fn new(store: S, config: EventProcessorConfig) -> Self {
        let dispatch = Arc::new(DispatchStream::new(config.dispatch_capacity));
        Self {
            inner: Arc::new(Inner {
                store,
                config,
                dispatch,
                state: Mutex::new(State::Idle),
            }),
        }
    }

    /// Returns the processor configuration.
    pub fn config(&self) -> &EventProcessorConfig {
        &self.inner.config
    }

    /// Returns the underlying store.
    pub fn store(&self) -> &S {
        &self.inner.store
    }

    /// A scheduler sharing this processor's store and dispatch stream.
    ///
    /// Useful for driving single ticks at a chosen instant.
    pub fn scheduler(&self) -> LeaseScheduler<S> {
        LeaseScheduler::new(
            self.inner.store.clone(),
            self.inner.config.clone(),
            Arc::clone(&self.inner.dispatch),
        )
    }

    /// A reclaimer sharing this processor's store and dispatch stream.
    pub fn reclaimer(&self) -> LeaseReclaimer<S> {
        LeaseReclaimer::new(
            self.inner.store.clone(),
            self.inner.config.clone(),
            Arc::clone(&self.inner.dispatch),
        )
    }

    /// Spawn the scheduler and reclaimer loops.
    ///
    /// Both tick immediately, then at their configured intervals. Calling
    /// `start` on a running or stopped processor does nothing.
    pub fn start(&self) {
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        match *state {
            State::Idle => {}
            State::Running { .. } => {
                debug!("Processor already running");
                return;
            }
            State::Stopped => {
                warn!("Processor was shut down and cannot be restarted");
                return;
            }
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let scheduler = self.scheduler();
        let scheduler_rx = shutdown_rx.clone();
        let reclaimer = self.reclaimer();
        let reclaimer_rx = shutdown_rx;

        let workers = vec![
            tokio::spawn(async move { scheduler.run(scheduler_rx).await }),
            tokio::spawn(async move { reclaimer.run(reclaimer_rx).await }),
        ];

        info!(
            lock_duration_secs = self.inner.config.lock_duration.as_secs(),
            max_concurrent_machines = self.inner.config.max_concurrent_machines,
            "Event processor started"
        );

        *state = State::Running {
            shutdown_tx,
            workers,
        };
    }

    /// Add an event to the queue.
    ///
    /// Events without an explicit attempt limit get the retry policy's
    /// `max_attempts`. Returns the stored row; its id is what consumers later
    /// pass to [`complete`](Self::complete).
    ///
    /// # Errors
    ///
    /// [`Error::Validation`] for malformed input (nothing is written), or a
    /// store error if the insert fails.
    pub async fn enqueue(&self, mut event: NewEvent) -> Result<QueuedEvent> {
        event.validate()?;
        if event.max_attempts.is_none() {
            event.max_attempts = Some(self.inner.config.retry_policy.max_attempts);
        }

        let queued = self
            .inner
            .store
            .enqueue(event, OffsetDateTime::now_utc())
            .await?;

        debug!(
            event_id = %queued.id,
            machine_id = %queued.machine_id,
            event_type = %queued.event_type,
            "Event enqueued"
        );

        Ok(queued)
    }

    /// Attach a subscriber to the dispatch stream.
    ///
    /// Only events locked after this call are delivered to it.
    pub fn subscribe(&self) -> EventStream {
        self.inner.dispatch.subscribe()
    }

    /// Report the outcome of a dispatched event.
    ///
    /// Never fails: completing an event that holds no lease (reclaimed, or
    /// already completed by another subscriber) is logged and ignored, and a
    /// store failure leaves the lease for the reclaimer. Returns what happened
    /// to the event, or `None` in those cases.
    pub async fn complete(&self, event_id: Uuid, success: bool) -> Option<Completion> {
        let result = self
            .inner
            .store
            .finalize(
                event_id,
                success,
                OffsetDateTime::now_utc(),
                &self.inner.config.retry_policy,
            )
            .await;
        self.inner.dispatch.release(event_id);

        match result {
            Ok(completion) => {
                match &completion {
                    Completion::Completed { duration } => {
                        debug!(%event_id, duration_ms = duration.as_millis() as u64, "Event completed");
                    }
                    Completion::Retrying {
                        attempts,
                        scheduled_for,
                    } => {
                        debug!(%event_id, attempts, %scheduled_for, "Event failed, will retry");
                    }
                    Completion::Failed { attempts } => {
                        warn!(%event_id, attempts, "Event exceeded max attempts, marked failed");
                    }
                }
                Some(completion)
            }
            Err(Error::NotFound(_)) => {
                warn!(%event_id, "Completion for an event without a lease, ignoring");
                None
            }
            Err(e) => {
                error!(%event_id, error = %e, "Failed to record completion");
                None
            }
        }
    }

    /// Every stored event for a machine, across all lifecycle tables.
    pub async fn events_by_machine(&self, machine_id: &MachineId) -> Result<MachineEvents> {
        self.inner.store.events_by_machine(machine_id).await
    }

    /// Stop the loops, wait for dispatched events, then close the stream.
    ///
    /// Waiting is bounded by `shutdown_timeout`; leases still open afterwards
    /// are recovered by a later reclaimer sweep. Safe to call more than once.
    pub async fn shutdown(&self) {
        let previous = {
            let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *state, State::Stopped)
        };

        let workers = match previous {
            State::Stopped => {
                debug!("Processor already shut down");
                return;
            }
            State::Idle => Vec::new(),
            State::Running {
                shutdown_tx,
                workers,
            } => {
                let _ = shutdown_tx.send(true);
                workers
            }
        };

        for handle in workers {
            if let Err(e) = handle.await {
                error!(error = %e, "Processor loop panicked");
            }
        }

        let shutdown_timeout = self.inner.config.shutdown_timeout;
        if !self.inner.dispatch.wait_drained(shutdown_timeout).await {
            warn!(
                in_flight = self.inner.dispatch.in_flight(),
                timeout_secs = shutdown_timeout.as_secs(),
                "Shutdown timeout exceeded, leaving open leases to the reclaimer"
            );
        }

        self.inner.dispatch.close();
        info!("Event processor stopped");
    }
}
