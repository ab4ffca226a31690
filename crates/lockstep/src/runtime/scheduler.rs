//! Scheduler loop: lock due events and push them to the dispatch stream.

use std::sync::Arc;

use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, error, info};

use super::EventProcessorConfig;
use super::dispatch::DispatchStream;
use crate::error::Result;
use crate::event::ProcessingEvent;
use crate::store::{LeaseTx, QueueStore};

/// Periodic fetch-and-lock loop.
///
/// # Lifecycle
///
/// 1. Tick immediately, then every `polling_interval`
/// 2. Begin a lease transaction
/// 3. Select up to `max_concurrent_machines` machines with due work and no
///    event in flight
/// 4. Lock the oldest due event of each machine
/// 5. Commit, then publish the locked batch to subscribers
/// 6. Repeat until shutdown signal
///
/// A failed tick rolls back every lock it took and the next tick retries.
pub struct LeaseScheduler<S: QueueStore> {
    store: S,
    config: EventProcessorConfig,
    dispatch: Arc<DispatchStream>,
}

impl<S: QueueStore> LeaseScheduler<S> {
    pub(crate) fn new(store: S, config: EventProcessorConfig, dispatch: Arc<DispatchStream>) -> Self {
        Self {
            store,
            config,
            dispatch,
        }
    }

    /// Run one scheduling pass at `now` and return the events it locked.
    pub async fn tick(&self, now: OffsetDateTime) -> Result<Vec<ProcessingEvent>> {
        let locked_until = now + self.config.lock_duration;
        let mut tx = self.store.begin_lease().await?;

        let machines = tx.fetch_due(now, self.config.machine_limit()).await?;
        if machines.is_empty() {
            return Ok(Vec::new());
        }

        let mut batch = Vec::with_capacity(machines.len());
        for machine_id in &machines {
            if let Some(event) = tx.lock_oldest(machine_id, now, locked_until).await? {
                batch.push(event);
            }
        }

        tx.commit().await?;

        if !batch.is_empty() {
            let delivered = self.dispatch.publish(batch.clone());
            debug!(
                locked = batch.len(),
                delivered,
                machines = machines.len(),
                "Scheduler locked events"
            );
        }

        Ok(batch)
    }

    /// Run the scheduler until shutdown signal.
    ///
    /// When the receiver signals, the current tick (if any) finishes and the
    /// loop exits without taking further leases.
    pub(crate) async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut poll_interval = interval(self.config.polling_interval);
        poll_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(
            polling_interval_ms = self.config.polling_interval.as_millis() as u64,
            machine_limit = self.config.machine_limit(),
            "Scheduler started"
        );

        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Scheduler shutting down");
                        break;
                    }
                }
                _ = poll_interval.tick() => {
                    if let Err(e) = self.tick(OffsetDateTime::now_utc()).await {
                        error!(error = %e, transient = e.is_transient(), "Scheduler tick failed");
                    }
                }
            }
        }
    }
}
