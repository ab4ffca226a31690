use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow};
use lockstep::{Backoff, EventProcessorConfig, RetryPolicy};
use time::OffsetDateTime;

/// Initialize tracing for tests. Safe to call multiple times.
///
/// The `try_init()` call is idempotent - subsequent calls are no-ops if
/// already initialized.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("lockstep=debug")
        .try_init();
}

pub const TEST_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(20);
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(10);
pub const TEST_LOCK_DURATION: Duration = Duration::from_secs(30);

/// A fixed, whole-millisecond instant for store tests.
pub fn test_now() -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(1_735_689_600).expect("valid timestamp")
}

/// Fast processor config for tests.
///
/// The reclaimer interval is long so that only explicit sweeps recover
/// leases, and retries become due almost immediately.
pub fn test_config() -> EventProcessorConfig {
    EventProcessorConfig {
        lock_duration: TEST_LOCK_DURATION,
        polling_interval: DEFAULT_POLL_INTERVAL,
        cleanup_interval: Duration::from_secs(3600),
        shutdown_timeout: Duration::from_secs(5),
        retry_policy: RetryPolicy {
            max_attempts: TEST_MAX_ATTEMPTS,
            backoff: Backoff::Fixed(Duration::from_millis(10)),
        },
        ..Default::default()
    }
}

/// Config using the production retry policy, for exact backoff assertions.
pub fn store_test_config() -> EventProcessorConfig {
    EventProcessorConfig {
        lock_duration: Duration::from_secs(60),
        ..Default::default()
    }
}

/// Tracks maximum concurrent executions for parallelism tests.
#[derive(Default)]
pub struct ConcurrencyTracker {
    current: AtomicUsize,
    max_seen: AtomicUsize,
}

impl ConcurrencyTracker {
    pub fn new() -> Arc<Self> {
        Arc::default()
    }

    pub fn enter(&self) {
        let count = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_seen.fetch_max(count, Ordering::SeqCst);
    }

    pub fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_seen.load(Ordering::SeqCst)
    }
}

/// Tracks concurrency per machine and the order events were seen in.
#[derive(Default)]
pub struct MachineTracker {
    active: Mutex<HashMap<String, usize>>,
    overlaps: AtomicUsize,
    seen: Mutex<Vec<(String, String)>>,
}

impl MachineTracker {
    pub fn new() -> Arc<Self> {
        Arc::default()
    }

    pub fn enter(&self, machine_id: &str, label: &str) {
        let mut active = self.active.lock().unwrap();
        let count = active.entry(machine_id.to_owned()).or_default();
        *count += 1;
        if *count > 1 {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        self.seen
            .lock()
            .unwrap()
            .push((machine_id.to_owned(), label.to_owned()));
    }

    pub fn exit(&self, machine_id: &str) {
        let mut active = self.active.lock().unwrap();
        if let Some(count) = active.get_mut(machine_id) {
            *count -= 1;
        }
    }

    /// Times a machine had more than one event in a handler at once.
    pub fn overlaps(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }

    /// Labels seen for one machine, in handling order.
    pub fn seen_for(&self, machine_id: &str) -> Vec<String> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter(|(machine, _)| machine == machine_id)
            .map(|(_, label)| label.clone())
            .collect()
    }

    pub fn total_seen(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

/// Poll until condition returns Some(T) or timeout expires.
pub async fn wait_until<F, Fut, T>(timeout: Duration, interval: Duration, check: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        if let Some(result) = check().await? {
            return Ok(result);
        }

        if tokio::time::Instant::now() > deadline {
            return Err(anyhow!("timeout waiting for condition"));
        }

        tokio::time::sleep(interval).await;
    }
}
