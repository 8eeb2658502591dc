//! Firehose ingestion pipeline.
//!
//! This crate turns a push-style newline-delimited JSON feed into Parquet
//! batch files, optionally forwarding every record to a message bus.
//!
//! # Modules
//!
//! - [`source`] - Upstream connection, retry policy, connection state
//! - [`pipeline`] - Batch accumulator, Parquet writer, bus forwarder
//! - [`lifecycle`] - Ingestion loop and shutdown coordination
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────┐
//! │  StreamSupervisor  │  Authenticated HTTP stream, retried with backoff
//! └─────────┬──────────┘
//!           │ raw lines
//!           ▼
//! ┌────────────────────┐
//! │    decode_line     │  Blank and malformed lines are skipped
//! └─────────┬──────────┘
//!           │ Event
//!           ├──────────────────────────┐
//!           ▼                          ▼
//! ┌────────────────────┐     ┌────────────────────┐
//! │  BatchAccumulator  │     │    BusForwarder    │  Best effort
//! └─────────┬──────────┘     └────────────────────┘
//!           │ count / age / shutdown
//!           ▼
//! ┌────────────────────┐
//! │ ParquetBatchWriter │  tweets_<UTC timestamp>.parquet
//! └────────────────────┘
//! ```
//!
//! The Parquet files are the durable output. On shutdown the
//! [`LifecycleController`] flushes the pending batch and drains the bus
//! forwarder before the process exits.

pub mod error;
pub mod lifecycle;
pub mod pipeline;
pub mod source;

// Re-export commonly used types at crate root
pub use error::{Error, Result};

pub use lifecycle::{LifecycleController, LifecyclePhase, Pipeline, PipelineConfig, RunStats};

pub use pipeline::{
    BatchAccumulator, BatchSink, BatchWriterConfig, BusForwarder, ChannelForwarder, Compression,
    DrainReport, FlushPolicy, FlushTrigger, ForwarderConfig, NoopForwarder, ParquetBatchWriter,
    Publisher,
};

#[cfg(feature = "kafka")]
pub use pipeline::{KafkaConfig, KafkaPublisher};

pub use source::{
    ConnectionState, Connector, RecordStream, RetryPolicy, SharedConnectionState, StreamConfig,
    StreamSupervisor,
};
