//! Ingestion loop and shutdown coordination.
//!
//! [`Pipeline`] wires a [`Connector`] to the batch stages. The
//! [`LifecycleController`] runs it and owns the shutdown sequence:
//!
//! ```text
//! Running ──request_shutdown()──► Draining ──final flush + bus drain──► Stopped
//! ```
//!
//! The loop is single-threaded by construction: lines are read, decoded,
//! forwarded and appended in order by one task. A one-second ticker flushes
//! batches that reach their age limit while the feed is quiet, including
//! while the connector is retrying.

use crate::pipeline::{
    BatchAccumulator, BatchSink, BusForwarder, DrainReport, FlushPolicy, FlushTrigger,
};
use crate::source::{
    Backoff, ConnectionState, Connector, RecordStream, RetryPolicy, SharedConnectionState,
};
use crate::{Error, Result};

use firehose_core::{Decoded, decode_line};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Process lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecyclePhase {
    Running = 0,
    Draining = 1,
    Stopped = 2,
}

impl LifecyclePhase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Running,
            1 => Self::Draining,
            _ => Self::Stopped,
        }
    }
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Shared shutdown switch and phase tracker.
///
/// Cheap to clone. The signal handler holds one clone, the ingestion loop
/// another.
#[derive(Debug, Clone)]
pub struct LifecycleController {
    token: CancellationToken,
    phase: Arc<AtomicU8>,
}

impl Default for LifecycleController {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleController {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            phase: Arc::new(AtomicU8::new(LifecyclePhase::Running as u8)),
        }
    }

    pub fn phase(&self) -> LifecyclePhase {
        LifecyclePhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// Token observed by the ingestion loop.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Begin shutdown. Safe to call from any thread, any number of times.
    ///
    /// Returns `true` only for the call that moved the process out of
    /// `Running`.
    pub fn request_shutdown(&self) -> bool {
        let first = self.enter_draining();
        if first {
            tracing::info!("Shutdown signal received, draining...");
        }
        self.token.cancel();
        first
    }

    fn enter_draining(&self) -> bool {
        self.phase
            .compare_exchange(
                LifecyclePhase::Running as u8,
                LifecyclePhase::Draining as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    fn mark_stopped(&self) {
        self.phase
            .store(LifecyclePhase::Stopped as u8, Ordering::Release);
    }

    /// Run the pipeline until shutdown or a fatal error, then drain it.
    ///
    /// The drain runs on every exit path. A fatal error is returned after
    /// the drain completes.
    pub async fn run<C, S, F>(&self, mut pipeline: Pipeline<C, S, F>) -> Result<RunStats>
    where
        C: Connector,
        S: BatchSink,
        F: BusForwarder,
    {
        let outcome = pipeline.ingest(&self.token).await;

        self.enter_draining();
        pipeline.drain().await;
        self.mark_stopped();

        outcome.map(|()| pipeline.stage.stats)
    }
}

/// Ingestion loop settings.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Batch flush thresholds.
    pub flush: FlushPolicy,

    /// Pause schedule between whole connect cycles.
    pub restart: RetryPolicy,

    /// How often batch age is checked while no lines arrive.
    /// Default: 1 second
    pub tick_interval: Duration,

    /// Log progress every this many events.
    /// Default: 10,000
    pub progress_interval: u64,

    /// Time allowed for the bus forwarder to drain at shutdown.
    /// Default: 5 seconds
    pub bus_drain_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            flush: FlushPolicy::default(),
            restart: RetryPolicy::restart(),
            tick_interval: Duration::from_secs(1),
            progress_interval: 10_000,
            bus_drain_timeout: Duration::from_secs(5),
        }
    }
}

/// Counters for one run.
#[derive(Debug, Clone, Default)]
pub struct RunStats {
    pub lines_read: u64,
    pub lines_skipped: u64,
    pub events_received: u64,
    pub batches_written: u64,
    pub events_written: u64,
    pub write_failures: u64,
    pub events_dropped: u64,
    pub restarts: u64,
    pub bus: DrainReport,
}

/// How one upstream session ended.
enum SessionEnd {
    Shutdown,
    Closed,
    Failed(Error),
}

/// Connector plus downstream stages.
pub struct Pipeline<C, S, F> {
    connector: C,
    stage: Stage<S, F>,
    restart: RetryPolicy,
    tick_interval: Duration,
    bus_drain_timeout: Duration,
}

impl<C, S, F> Pipeline<C, S, F>
where
    C: Connector,
    S: BatchSink,
    F: BusForwarder,
{
    pub fn new(connector: C, sink: S, forwarder: F, config: PipelineConfig) -> Self {
        let state = connector.connection_state().clone();
        Self {
            connector,
            stage: Stage {
                accumulator: BatchAccumulator::new(config.flush),
                sink,
                forwarder,
                state,
                progress_interval: config.progress_interval,
                stats: RunStats::default(),
            },
            restart: config.restart,
            tick_interval: config.tick_interval,
            bus_drain_timeout: config.bus_drain_timeout,
        }
    }

    /// Outer loop: connect, consume, reconnect. Returns on shutdown or a
    /// fatal error.
    async fn ingest(&mut self, shutdown: &CancellationToken) -> Result<()> {
        let mut restart = self.restart.start();
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!("Starting ingestion...");

        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }

            let connected = {
                let Self {
                    connector, stage, ..
                } = &mut *self;
                while_ticking(&mut ticker, stage, connector.connect(shutdown)).await
            };

            let mut stream = match connected {
                Ok(stream) => stream,
                Err(Error::Cancelled) => return Ok(()),
                Err(e) if e.is_fatal() => {
                    tracing::error!("Fatal upstream error: {}", e);
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!("Connect cycle failed: {}", e);
                    self.pause(&mut restart, &mut ticker, shutdown).await;
                    continue;
                }
            };

            let lines_before = self.stage.stats.lines_read;
            let ended = self.consume(&mut stream, &mut ticker, shutdown).await;
            drop(stream);

            if self.stage.stats.lines_read > lines_before {
                restart.reset();
            }

            match ended {
                SessionEnd::Shutdown => return Ok(()),
                SessionEnd::Closed => tracing::warn!("Upstream closed the stream"),
                SessionEnd::Failed(e) => tracing::warn!("Stream failed: {}", e),
            }

            self.stage.state.set(ConnectionState::Backoff);
            self.pause(&mut restart, &mut ticker, shutdown).await;
        }
    }

    /// Read lines from one session until it ends or shutdown is requested.
    async fn consume(
        &mut self,
        stream: &mut C::Stream,
        ticker: &mut Interval,
        shutdown: &CancellationToken,
    ) -> SessionEnd {
        loop {
            if shutdown.is_cancelled() {
                return SessionEnd::Shutdown;
            }

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return SessionEnd::Shutdown,
                _ = ticker.tick() => self.stage.flush_if_due(),
                line = stream.next_line() => match line {
                    Ok(Some(line)) => self.stage.handle_line(&line).await,
                    Ok(None) => return SessionEnd::Closed,
                    Err(e) => return SessionEnd::Failed(e),
                },
            }
        }
    }

    /// Wait out the restart backoff, flushing on schedule meanwhile.
    async fn pause(
        &mut self,
        restart: &mut Backoff,
        ticker: &mut Interval,
        shutdown: &CancellationToken,
    ) {
        let delay = restart.next_delay().unwrap_or(self.restart.max_delay);
        self.stage.stats.restarts += 1;
        metrics::counter!("stream_restarts_total").increment(1);
        tracing::info!("Reconnecting in {:?}", delay);

        let wait = async {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        };
        while_ticking(ticker, &mut self.stage, wait).await;
    }

    /// Final flush and bus drain.
    async fn drain(&mut self) {
        tracing::info!(
            "Draining: {} pending events",
            self.stage.accumulator.len()
        );
        self.stage.flush(FlushTrigger::Shutdown);
        self.stage.stats.bus = self.stage.forwarder.drain(self.bus_drain_timeout).await;
        self.stage.state.set(ConnectionState::Disconnected);
    }
}

/// Drive `fut` to completion, running interval flushes while it is pending.
async fn while_ticking<T, S, F>(
    ticker: &mut Interval,
    stage: &mut Stage<S, F>,
    fut: impl Future<Output = T>,
) -> T
where
    S: BatchSink,
    F: BusForwarder,
{
    tokio::pin!(fut);
    loop {
        tokio::select! {
            out = &mut fut => return out,
            _ = ticker.tick() => stage.flush_if_due(),
        }
    }
}

/// Everything downstream of the connector.
struct Stage<S, F> {
    accumulator: BatchAccumulator,
    sink: S,
    forwarder: F,
    state: SharedConnectionState,
    progress_interval: u64,
    stats: RunStats,
}

impl<S, F> Stage<S, F>
where
    S: BatchSink,
    F: BusForwarder,
{
    async fn handle_line(&mut self, line: &str) {
        self.stats.lines_read += 1;
        metrics::counter!("stream_lines_total").increment(1);

        let event = match decode_line(line) {
            Decoded::Event(event) => event,
            Decoded::Skip(reason) => {
                self.stats.lines_skipped += 1;
                metrics::counter!("stream_lines_skipped_total", "reason" => reason.as_str())
                    .increment(1);
                return;
            }
        };

        self.stats.events_received += 1;
        metrics::counter!("stream_events_total").increment(1);

        self.forwarder.forward(&event).await;
        self.accumulator.append(event);
        metrics::gauge!("batch_pending_events").set(self.accumulator.len() as f64);

        if let Some(trigger) = self.accumulator.flush_trigger(Instant::now()) {
            self.flush(trigger);
        }

        if self.stats.events_received.is_multiple_of(self.progress_interval) {
            tracing::info!(
                "Progress: {} events received, {} batches written, connection {}",
                self.stats.events_received,
                self.stats.batches_written,
                self.state.get()
            );
        }
    }

    fn flush_if_due(&mut self) {
        if let Some(trigger) = self.accumulator.flush_trigger(Instant::now()) {
            self.flush(trigger);
        }
    }

    /// Take the current batch and write it. The accumulator is reset whether
    /// or not the write succeeds.
    fn flush(&mut self, trigger: FlushTrigger) {
        let batch = self.accumulator.take_and_reset();
        metrics::gauge!("batch_pending_events").set(0.0);

        if batch.is_empty() {
            return;
        }

        let count = batch.len() as u64;
        match self.sink.write(&batch) {
            Ok(written) => {
                self.stats.batches_written += 1;
                self.stats.events_written += count;
                metrics::counter!("batch_flushes_total", "trigger" => trigger.as_str())
                    .increment(1);
                metrics::counter!("batch_events_written_total").increment(count);
                if let Some(written) = written {
                    tracing::debug!(
                        "Flushed {} events ({}) to {}",
                        count,
                        trigger.as_str(),
                        written.path.display()
                    );
                }
            }
            Err(e) => {
                self.stats.write_failures += 1;
                self.stats.events_dropped += count;
                metrics::counter!("batch_write_errors_total").increment(1);
                metrics::counter!("batch_events_dropped_total").increment(count);
                tracing::error!(
                    "Failed to write batch of {} events ({} flush), dropping it: {}",
                    count,
                    trigger.as_str(),
                    e
                );
            }
        }
    }
}
