//! Processor configuration.

use std::time::Duration;

use crate::retry::RetryPolicy;

/// Configuration for an [`EventProcessor`](crate::EventProcessor).
///
/// Controls polling and sweep cadence, lease length, the per-tick machine
/// ceiling and retry behavior.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use lockstep::EventProcessorConfig;
///
/// let config = EventProcessorConfig {
///     polling_interval: Duration::from_millis(250),
///     lock_duration: Duration::from_secs(30),
///     max_concurrent_machines: 4,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct EventProcessorConfig {
    /// Lease granted to each locked event.
    ///
    /// Should be longer than the longest expected handler run. If a consumer
    /// dies, its event is recovered by the reclaimer once this passes.
    /// Default: 60 seconds.
    pub lock_duration: Duration,

    /// Ceiling on distinct machines locked per scheduler tick.
    ///
    /// Also sizes the consumer's semaphore of concurrently serviced machines.
    /// Default: 10.
    pub max_concurrent_machines: usize,

    /// Reserved for per-machine batching. Currently unused.
    ///
    /// Default: 100.
    pub batch_size: usize,

    /// How often the reclaimer sweeps for expired leases.
    ///
    /// Default: 5 minutes.
    pub cleanup_interval: Duration,

    /// How often the scheduler looks for due events.
    ///
    /// Lower values reduce latency but increase store load.
    /// Default: 1 second.
    pub polling_interval: Duration,

    /// Attempt limit and backoff for failed or abandoned events.
    pub retry_policy: RetryPolicy,

    /// Maximum time [`shutdown`](crate::EventProcessor::shutdown) waits for
    /// dispatched events to be completed.
    ///
    /// Leases still open afterwards are recovered by a later reclaimer sweep.
    /// Default: 30 seconds.
    pub shutdown_timeout: Duration,

    /// Events buffered per subscriber before a slow subscriber starts
    /// skipping.
    ///
    /// Default: 1024.
    pub dispatch_capacity: usize,
}

impl Default for EventProcessorConfig {
    fn default() -> Self {
        Self {
            lock_duration: Duration::from_secs(60),
            max_concurrent_machines: 10,
            batch_size: 100,
            cleanup_interval: Duration::from_secs(300), // 5 minutes
            polling_interval: Duration::from_secs(1),
            retry_policy: RetryPolicy::default(),
            shutdown_timeout: Duration::from_secs(30),
            dispatch_capacity: 1024,
        }
    }
}

impl EventProcessorConfig {
    /// Machines the scheduler may lock per tick. Never zero.
    pub(crate) fn machine_limit(&self) -> u32 {
        u32::try_from(self.max_concurrent_machines.max(1)).unwrap_or(u32::MAX)
    }
}
