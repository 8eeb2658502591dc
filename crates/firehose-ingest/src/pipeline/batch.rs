//! Batch accumulation and flush policy.
//!
//! The [`BatchAccumulator`] buffers decoded events in arrival order and
//! reports when the current batch is due. It never writes anything itself;
//! the ingestion loop takes the batch with [`BatchAccumulator::take_and_reset`]
//! and hands it to a sink.

use firehose_core::Event;
use std::time::Duration;
use tokio::time::Instant;

/// Most event slots reserved up front for a new batch.
const MAX_PREALLOCATED_EVENTS: usize = 1024;

/// When a batch must be flushed.
#[derive(Debug, Clone)]
pub struct FlushPolicy {
    /// Flush once this many events are buffered.
    /// Default: 100
    pub max_events: usize,

    /// Flush once the batch has been open this long.
    /// Default: 30 seconds
    pub max_interval: Duration,
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self {
            max_events: 100,
            max_interval: Duration::from_secs(30),
        }
    }
}

/// Why a flush happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    /// The batch reached `max_events`.
    Count,
    /// The batch reached `max_interval`.
    Interval,
    /// Shutdown is draining the accumulator.
    Shutdown,
}

impl FlushTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Count => "count",
            Self::Interval => "interval",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Events accumulated since the previous flush.
#[derive(Debug)]
pub struct Batch {
    /// Events in arrival order.
    pub events: Vec<Event>,

    /// When accumulation of this batch began.
    pub started_at: Instant,
}

impl Batch {
    fn new(capacity: usize) -> Self {
        Self {
            events: Vec::with_capacity(capacity.min(MAX_PREALLOCATED_EVENTS)),
            started_at: Instant::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Buffers events until the [`FlushPolicy`] says to write them.
#[derive(Debug)]
pub struct BatchAccumulator {
    policy: FlushPolicy,
    current: Batch,
}

impl BatchAccumulator {
    pub fn new(policy: FlushPolicy) -> Self {
        let current = Batch::new(policy.max_events);
        Self { policy, current }
    }

    pub fn append(&mut self, event: Event) {
        self.current.events.push(event);
    }

    pub fn len(&self) -> usize {
        self.current.len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_empty()
    }

    /// Age of the current batch.
    pub fn age(&self) -> Duration {
        self.current.started_at.elapsed()
    }

    /// Which threshold, if any, the batch has reached at `now`.
    ///
    /// Count takes precedence when both are met.
    pub fn flush_trigger(&self, now: Instant) -> Option<FlushTrigger> {
        if self.current.len() >= self.policy.max_events {
            Some(FlushTrigger::Count)
        } else if now.saturating_duration_since(self.current.started_at) >= self.policy.max_interval
        {
            Some(FlushTrigger::Interval)
        } else {
            None
        }
    }

    /// Whether either threshold has been reached.
    pub fn should_flush(&self) -> bool {
        self.flush_trigger(Instant::now()).is_some()
    }

    /// Hand over the current batch and start an empty one.
    pub fn take_and_reset(&mut self) -> Batch {
        std::mem::replace(&mut self.current, Batch::new(self.policy.max_events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: u32) -> Event {
        Event::from_json(&format!(r#"{{"data":{{"id":"{}"}}}}"#, id)).unwrap()
    }

    fn policy() -> FlushPolicy {
        FlushPolicy {
            max_events: 100,
            max_interval: Duration::from_secs(30),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_starts_empty_and_not_due() {
        let acc = BatchAccumulator::new(policy());
        assert!(acc.is_empty());
        assert!(!acc.should_flush());
    }

    #[tokio::test(start_paused = true)]
    async fn test_count_threshold() {
        let mut acc = BatchAccumulator::new(policy());
        for i in 0..99 {
            acc.append(event(i));
        }
        assert!(!acc.should_flush());

        acc.append(event(99));
        assert_eq!(acc.flush_trigger(Instant::now()), Some(FlushTrigger::Count));
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_threshold() {
        let mut acc = BatchAccumulator::new(policy());
        acc.append(event(1));

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(!acc.should_flush());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(
            acc.flush_trigger(Instant::now()),
            Some(FlushTrigger::Interval)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_applies_to_empty_batch() {
        let acc = BatchAccumulator::new(policy());
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(acc.should_flush());
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_and_reset_preserves_order_and_restarts_clock() {
        let mut acc = BatchAccumulator::new(policy());
        for i in 0..5 {
            acc.append(event(i));
        }
        tokio::time::advance(Duration::from_secs(10)).await;

        let batch = acc.take_and_reset();
        let ids: Vec<String> = batch.events.iter().filter_map(|e| e.id()).collect();
        assert_eq!(ids, vec!["0", "1", "2", "3", "4"]);

        assert!(acc.is_empty());
        assert_eq!(acc.age(), Duration::ZERO);
        assert!(batch.started_at < Instant::now());
    }

    #[test]
    fn test_huge_count_threshold_does_not_preallocate() {
        let mut acc = BatchAccumulator::new(FlushPolicy {
            max_events: usize::MAX,
            max_interval: Duration::from_secs(30),
        });
        assert!(acc.current.events.capacity() <= 2 * MAX_PREALLOCATED_EVENTS);

        acc.append(event(1));
        let batch = acc.take_and_reset();
        assert_eq!(batch.len(), 1);
        assert!(acc.current.events.capacity() <= 2 * MAX_PREALLOCATED_EVENTS);
    }

    #[test]
    fn test_trigger_labels() {
        assert_eq!(FlushTrigger::Count.as_str(), "count");
        assert_eq!(FlushTrigger::Interval.as_str(), "interval");
        assert_eq!(FlushTrigger::Shutdown.as_str(), "shutdown");
    }
}
