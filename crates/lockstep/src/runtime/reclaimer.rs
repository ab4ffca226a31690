//! Reclaimer loop: recover leases abandoned by dead or stuck consumers.

use std::sync::Arc;

use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{error, info};

use super::EventProcessorConfig;
use super::dispatch::DispatchStream;
use crate::error::Result;
use crate::event::ReclaimReport;
use crate::store::QueueStore;

/// Periodic stale-lease sweep.
///
/// Every processing event whose `locked_until` has passed is treated as a
/// failed attempt: re-queued with backoff, or failed once attempts run out.
/// Recovered events are no longer waited on by shutdown.
pub struct LeaseReclaimer<S: QueueStore> {
    store: S,
    config: EventProcessorConfig,
    dispatch: Arc<DispatchStream>,
}

impl<S: QueueStore> LeaseReclaimer<S> {
    pub(crate) fn new(store: S, config: EventProcessorConfig, dispatch: Arc<DispatchStream>) -> Self {
        Self {
            store,
            config,
            dispatch,
        }
    }

    /// Run one sweep at `now`.
    pub async fn sweep(&self, now: OffsetDateTime) -> Result<ReclaimReport> {
        let report = self
            .store
            .reclaim_expired(now, &self.config.retry_policy)
            .await?;

        for event_id in report.reclaimed() {
            self.dispatch.release(event_id);
        }

        if !report.is_empty() {
            info!(
                requeued = report.requeued.len(),
                failed = report.failed.len(),
                "Reclaimed expired leases"
            );
        }

        Ok(report)
    }

    /// Run the reclaimer until shutdown signal.
    pub(crate) async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut sweep_interval = interval(self.config.cleanup_interval);
        sweep_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(
            cleanup_interval_secs = self.config.cleanup_interval.as_secs(),
            "Reclaimer started"
        );

        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Reclaimer shutting down");
                        break;
                    }
                }
                _ = sweep_interval.tick() => {
                    if let Err(e) = self.sweep(OffsetDateTime::now_utc()).await {
                        error!(error = %e, transient = e.is_transient(), "Lease sweep failed");
                    }
                }
            }
        }
    }
}
