//! Best-effort forwarding of events to a message bus.
//!
//! The ingestion loop only sees the [`BusForwarder`] trait. Two
//! implementations exist:
//!
//! - [`NoopForwarder`] when no bus is configured
//! - [`ChannelForwarder`] which queues serialized events on a bounded
//!   channel drained by a background task that calls a [`Publisher`]
//!
//! ```text
//! forward() ──try_send──► [bounded mpsc] ──► delivery task ──► Publisher::publish
//!     │ full                                                       │ error
//!     └─ wait backpressure_wait, then drop                         └─ log + count
//! ```
//!
//! Forwarding never returns an error and never blocks longer than
//! `backpressure_wait`, so a slow or absent bus cannot stall batch writes.

use crate::Result;

use firehose_core::Event;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Minimum spacing between repeated drop or publish-failure log lines.
const ERROR_LOG_INTERVAL: Duration = Duration::from_secs(10);

/// Spaces out a repeating warning to one line per [`ERROR_LOG_INTERVAL`].
#[derive(Debug, Default)]
struct LogThrottle {
    last: Option<Instant>,
    suppressed: u64,
}

impl LogThrottle {
    /// Returns how many occurrences were suppressed when a line is due.
    fn check(&mut self) -> Option<u64> {
        if self.last.is_none_or(|at| at.elapsed() >= ERROR_LOG_INTERVAL) {
            self.last = Some(Instant::now());
            Some(std::mem::take(&mut self.suppressed))
        } else {
            self.suppressed += 1;
            None
        }
    }
}

/// Outcome of draining a forwarder at shutdown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Records the publisher accepted and did not later report as
    /// undeliverable.
    pub forwarded: u64,

    /// Records the publisher rejected, or accepted and then failed to
    /// deliver.
    pub failed: u64,

    /// Records dropped because the buffer stayed full.
    pub dropped: u64,

    /// Records still queued or in flight when the drain gave up.
    pub abandoned: u64,

    /// Whether the drain hit its timeout.
    pub timed_out: bool,
}

/// Hands each event to a message bus without ever failing the caller.
pub trait BusForwarder: Send {
    /// Queue one event for publishing.
    fn forward(&mut self, event: &Event) -> impl Future<Output = ()> + Send;

    /// Deliver what is queued, giving up after `timeout`.
    ///
    /// Forwarding after a drain is a no-op.
    fn drain(&mut self, timeout: Duration) -> impl Future<Output = DrainReport> + Send;

    /// Whether events actually leave the process.
    fn is_active(&self) -> bool {
        true
    }
}

/// Forwarder used when no bus is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopForwarder;

impl BusForwarder for NoopForwarder {
    async fn forward(&mut self, _event: &Event) {}

    async fn drain(&mut self, _timeout: Duration) -> DrainReport {
        DrainReport::default()
    }

    fn is_active(&self) -> bool {
        false
    }
}

/// Delivers one serialized record to a bus.
pub trait Publisher: Send + Sync + 'static {
    /// Publish one JSON payload.
    fn publish(&self, payload: Vec<u8>) -> impl Future<Output = Result<()>> + Send;

    /// Block until records handed to the bus client are acknowledged, or
    /// `timeout` elapses.
    fn flush(&self, timeout: Duration) -> Result<()> {
        let _ = timeout;
        Ok(())
    }

    /// Records accepted by `publish` that the bus later reported as
    /// undeliverable.
    fn delivery_failures(&self) -> u64 {
        0
    }
}

/// Configuration for [`ChannelForwarder`].
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// Records buffered between the loop and the delivery task.
    /// Default: 10,000
    pub capacity: usize,

    /// How long `forward` waits for space before dropping a record.
    /// Default: 500ms
    pub backpressure_wait: Duration,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            backpressure_wait: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Default)]
struct ForwarderStats {
    enqueued: AtomicU64,
    forwarded: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

/// Forwarder backed by a bounded channel and a background delivery task.
pub struct ChannelForwarder<P: Publisher> {
    config: ForwarderConfig,
    sender: Option<mpsc::Sender<Vec<u8>>>,
    task: Option<JoinHandle<()>>,
    publisher: Arc<P>,
    stats: Arc<ForwarderStats>,
    drop_log: LogThrottle,
}

impl<P: Publisher> ChannelForwarder<P> {
    /// Start the delivery task. Must be called inside a Tokio runtime.
    pub fn spawn(publisher: P, config: ForwarderConfig) -> Self {
        let (sender, receiver) = mpsc::channel(config.capacity.max(1));
        let publisher = Arc::new(publisher);
        let stats = Arc::new(ForwarderStats::default());

        let task = tokio::spawn(deliver(
            receiver,
            Arc::clone(&publisher),
            Arc::clone(&stats),
        ));

        Self {
            config,
            sender: Some(sender),
            task: Some(task),
            publisher,
            stats,
            drop_log: LogThrottle::default(),
        }
    }

    /// Snapshot of the counters so far.
    pub fn report(&self) -> DrainReport {
        let enqueued = self.stats.enqueued.load(Ordering::Relaxed);
        let accepted = self.stats.forwarded.load(Ordering::Relaxed);
        let rejected = self.stats.failed.load(Ordering::Relaxed);
        let undelivered = self.publisher.delivery_failures().min(accepted);
        DrainReport {
            forwarded: accepted - undelivered,
            failed: rejected + undelivered,
            dropped: self.stats.dropped.load(Ordering::Relaxed),
            abandoned: enqueued.saturating_sub(accepted + rejected),
            timed_out: false,
        }
    }

    fn record_drop(&mut self) {
        let dropped = self.stats.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::counter!("bus_dropped_total").increment(1);
        if let Some(suppressed) = self.drop_log.check() {
            tracing::warn!(
                "Bus buffer full for {:?}, dropping record ({} dropped so far, {} similar warnings suppressed)",
                self.config.backpressure_wait,
                dropped,
                suppressed
            );
        }
    }
}

impl<P: Publisher> BusForwarder for ChannelForwarder<P> {
    async fn forward(&mut self, event: &Event) {
        let Some(sender) = self.sender.as_ref() else {
            return;
        };

        let payload = match event.to_json_bytes() {
            Ok(payload) => payload,
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Failed to serialize event for bus: {}", e);
                return;
            }
        };

        let queued = match sender.try_send(payload) {
            Ok(()) => true,
            Err(TrySendError::Full(payload)) => matches!(
                tokio::time::timeout(self.config.backpressure_wait, sender.send(payload)).await,
                Ok(Ok(()))
            ),
            Err(TrySendError::Closed(_)) => false,
        };

        if queued {
            self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
        } else {
            self.record_drop();
        }
    }

    async fn drain(&mut self, timeout: Duration) -> DrainReport {
        let deadline = Instant::now() + timeout;

        // Closing the channel lets the delivery task finish once the buffer
        // is empty.
        self.sender.take();

        let mut timed_out = false;
        if let Some(mut task) = self.task.take() {
            match tokio::time::timeout_at(deadline, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!("Bus delivery task failed: {}", e),
                Err(_) => {
                    timed_out = true;
                    task.abort();
                }
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let publisher = Arc::clone(&self.publisher);
        match tokio::task::spawn_blocking(move || publisher.flush(remaining)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                timed_out = true;
                tracing::warn!("Bus flush incomplete: {}", e);
            }
            Err(e) => tracing::error!("Bus flush task failed: {}", e),
        }

        let report = DrainReport {
            timed_out,
            ..self.report()
        };

        if report.timed_out || report.abandoned > 0 {
            tracing::warn!(
                "Bus drain timed out after {:?}: {} forwarded, {} abandoned",
                timeout,
                report.forwarded,
                report.abandoned
            );
        } else {
            tracing::info!(
                "Bus drained: {} forwarded, {} failed, {} dropped",
                report.forwarded,
                report.failed,
                report.dropped
            );
        }

        report
    }
}

/// Background delivery loop. Runs until the channel is closed and empty.
async fn deliver<P: Publisher>(
    mut receiver: mpsc::Receiver<Vec<u8>>,
    publisher: Arc<P>,
    stats: Arc<ForwarderStats>,
) {
    let mut error_log = LogThrottle::default();

    while let Some(payload) = receiver.recv().await {
        match publisher.publish(payload).await {
            Ok(()) => {
                stats.forwarded.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("bus_forwarded_total").increment(1);
            }
            Err(e) => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("bus_publish_errors_total").increment(1);

                if let Some(suppressed) = error_log.check() {
                    tracing::warn!(
                        "Bus publish failed ({} similar errors suppressed): {}",
                        suppressed,
                        e
                    );
                }
            }
        }
    }

    tracing::debug!("Bus delivery task finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::sync::Mutex;

    fn event(id: u32) -> Event {
        Event::from_json(&format!(r#"{{"data":{{"id":"{}"}}}}"#, id)).unwrap()
    }

    #[derive(Default)]
    struct RecordingPublisher {
        payloads: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl Publisher for RecordingPublisher {
        async fn publish(&self, payload: Vec<u8>) -> Result<()> {
            self.payloads.lock().unwrap().push(payload);
            Ok(())
        }
    }

    struct FailingPublisher;

    impl Publisher for FailingPublisher {
        async fn publish(&self, _payload: Vec<u8>) -> Result<()> {
            Err(Error::Bus("broker unavailable".to_string()))
        }
    }

    /// Accepts every record, then reports some as undeliverable.
    struct LossyPublisher {
        lost: u64,
    }

    impl Publisher for LossyPublisher {
        async fn publish(&self, _payload: Vec<u8>) -> Result<()> {
            Ok(())
        }

        fn delivery_failures(&self) -> u64 {
            self.lost
        }
    }

    /// Never completes a publish.
    struct StuckPublisher;

    impl Publisher for StuckPublisher {
        async fn publish(&self, _payload: Vec<u8>) -> Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    // =========================================================================
    // NoopForwarder
    // =========================================================================

    #[tokio::test]
    async fn test_noop_forwarder_reports_nothing() {
        let mut forwarder = NoopForwarder;
        forwarder.forward(&event(1)).await;
        assert!(!forwarder.is_active());
        assert_eq!(
            forwarder.drain(Duration::from_secs(5)).await,
            DrainReport::default()
        );
    }

    // =========================================================================
    // ChannelForwarder
    // =========================================================================

    #[tokio::test]
    async fn test_forwards_full_records_in_order() {
        let publisher = RecordingPublisher::default();
        let payloads = Arc::clone(&publisher.payloads);
        let mut forwarder = ChannelForwarder::spawn(publisher, ForwarderConfig::default());

        for i in 0..3 {
            forwarder.forward(&event(i)).await;
        }
        let report = forwarder.drain(Duration::from_secs(5)).await;

        assert_eq!(report.forwarded, 3);
        assert_eq!(report.abandoned, 0);
        assert!(!report.timed_out);

        let payloads = payloads.lock().unwrap();
        let ids: Vec<String> = payloads
            .iter()
            .map(|p| {
                let value: serde_json::Value = serde_json::from_slice(p).unwrap();
                value["data"]["id"].as_str().unwrap().to_string()
            })
            .collect();
        assert_eq!(ids, vec!["0", "1", "2"]);
    }

    #[tokio::test]
    async fn test_publish_failures_are_counted_not_raised() {
        let mut forwarder = ChannelForwarder::spawn(FailingPublisher, ForwarderConfig::default());

        for i in 0..4 {
            forwarder.forward(&event(i)).await;
        }
        let report = forwarder.drain(Duration::from_secs(5)).await;

        assert_eq!(report.forwarded, 0);
        assert_eq!(report.failed, 4);
        assert!(!report.timed_out);
    }

    #[tokio::test]
    async fn test_late_delivery_failures_are_not_counted_as_forwarded() {
        let mut forwarder =
            ChannelForwarder::spawn(LossyPublisher { lost: 2 }, ForwarderConfig::default());

        for i in 0..5 {
            forwarder.forward(&event(i)).await;
        }
        let report = forwarder.drain(Duration::from_secs(5)).await;

        assert_eq!(report.forwarded, 3);
        assert_eq!(report.failed, 2);
        assert_eq!(report.abandoned, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_warnings_are_throttled() {
        let mut throttle = LogThrottle::default();

        assert_eq!(throttle.check(), Some(0));
        assert_eq!(throttle.check(), None);
        assert_eq!(throttle.check(), None);

        tokio::time::advance(ERROR_LOG_INTERVAL).await;
        assert_eq!(throttle.check(), Some(2));
        assert_eq!(throttle.check(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_buffer_waits_then_drops() {
        let config = ForwarderConfig {
            capacity: 1,
            backpressure_wait: Duration::from_millis(500),
        };
        let mut forwarder = ChannelForwarder::spawn(StuckPublisher, config);

        // First record is picked up by the delivery task and never completes.
        forwarder.forward(&event(1)).await;
        // Second waits until the task frees the slot.
        forwarder.forward(&event(2)).await;

        let started = Instant::now();
        forwarder.forward(&event(3)).await;
        assert_eq!(started.elapsed(), Duration::from_millis(500));

        let report = forwarder.report();
        assert_eq!(report.dropped, 1);
        assert_eq!(report.abandoned, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_gives_up_after_timeout() {
        let mut forwarder = ChannelForwarder::spawn(StuckPublisher, ForwarderConfig::default());
        forwarder.forward(&event(1)).await;
        forwarder.forward(&event(2)).await;

        let started = Instant::now();
        let report = forwarder.drain(Duration::from_secs(5)).await;

        assert!(report.timed_out);
        assert_eq!(report.abandoned, 2);
        assert_eq!(started.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_forward_after_drain_is_noop() {
        let publisher = RecordingPublisher::default();
        let payloads = Arc::clone(&publisher.payloads);
        let mut forwarder = ChannelForwarder::spawn(publisher, ForwarderConfig::default());

        forwarder.drain(Duration::from_secs(1)).await;
        forwarder.forward(&event(1)).await;

        assert!(payloads.lock().unwrap().is_empty());
        assert_eq!(forwarder.report().dropped, 0);
    }
}
