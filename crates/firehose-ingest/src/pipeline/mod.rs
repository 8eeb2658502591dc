//! Downstream stages of the ingestion loop.
//!
//! - [`BatchAccumulator`] - Buffers events and decides when to flush
//! - [`ParquetBatchWriter`] - Writes each flushed batch to a Parquet file
//! - [`BusForwarder`] - Best-effort per-event forwarding to a message bus
//! - `KafkaPublisher` - Kafka backend for the forwarder (`kafka` feature)
//!
//! # Architecture
//!
//! ```text
//!            ┌──► [BusForwarder] ──► message bus (best effort)
//! [Event] ───┤
//!            └──► [BatchAccumulator] ──flush──► [BatchSink] ──► tweets_*.parquet
//! ```
//!
//! The Parquet files are the durable record. The bus is a side channel whose
//! failures never affect what is written or when.

mod batch;
mod bus;
#[cfg(feature = "kafka")]
mod kafka;
mod writer;

pub use batch::{Batch, BatchAccumulator, FlushPolicy, FlushTrigger};
pub use bus::{
    BusForwarder, ChannelForwarder, DrainReport, ForwarderConfig, NoopForwarder, Publisher,
};
#[cfg(feature = "kafka")]
pub use kafka::{DeliveryLogger, KafkaConfig, KafkaPublisher};
pub use writer::{
    BatchSink, BatchWriterConfig, Compression, ParquetBatchWriter, WrittenBatch,
    event_schema,
};
