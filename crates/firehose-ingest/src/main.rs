//! Firehose streaming ingestion daemon.
//!
//! Holds a connection to the sampled stream endpoint, writes decoded records
//! to Parquet batch files, and optionally forwards each record to Kafka.
//!
//! # Usage
//!
//! ```bash
//! # Minimal: token from the environment, batches under ./data/stream
//! TWITTER_BEARER=... firehose-ingest
//!
//! # Custom output and batching
//! firehose-ingest --output-dir /srv/stream --max-batch-events 500 --max-batch-interval-secs 60
//!
//! # Forward to Kafka (requires the `kafka` feature)
//! KAFKA_BROKER=redpanda:9092 KAFKA_TOPIC=tweets firehose-ingest
//! ```
//!
//! # Graceful Shutdown
//!
//! The daemon handles SIGINT (Ctrl+C) and SIGTERM:
//! 1. Stops reading from the upstream connection
//! 2. Writes the pending batch, however small
//! 3. Drains the bus forwarder (bounded wait)
//! 4. Exits zero
//!
//! A missing bearer token is fatal and exits non-zero.

use anyhow::{Context, Result};
use clap::Parser;
use firehose_core::metrics::{init_metrics, set_gauge, start_metrics_server};
use firehose_ingest::{
    BatchWriterConfig, BusForwarder, Compression, FlushPolicy, ForwarderConfig,
    LifecycleController, NoopForwarder, ParquetBatchWriter, Pipeline, PipelineConfig,
    RetryPolicy, RunStats, StreamConfig, StreamSupervisor,
};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[cfg(feature = "kafka")]
use firehose_ingest::{ChannelForwarder, KafkaConfig, KafkaPublisher};

/// Firehose streaming ingestion daemon.
#[derive(Parser, Debug)]
#[command(name = "firehose-ingest")]
#[command(about = "Stream ingestion daemon: upstream feed to Parquet batches")]
#[command(version)]
struct Args {
    /// Bearer token for the streaming endpoint
    #[arg(long, env = "TWITTER_BEARER", hide_env_values = true)]
    bearer_token: Option<String>,

    /// Streaming endpoint URL
    #[arg(
        long,
        env = "STREAM_URL",
        default_value = "https://api.x.com/2/tweets/sample/stream"
    )]
    stream_url: String,

    /// Tweet fields requested from the stream
    #[arg(
        long,
        env = "TWEET_FIELDS",
        default_value = "id,text,author_id,created_at,lang,public_metrics,possibly_sensitive,source"
    )]
    tweet_fields: String,

    /// User fields requested for expanded authors
    #[arg(
        long,
        env = "USER_FIELDS",
        default_value = "username,name,public_metrics,verified,created_at"
    )]
    user_fields: String,

    /// Expansions requested from the stream
    #[arg(long, default_value = "author_id")]
    expansions: String,

    /// Data root; batches go to <data-dir>/stream unless --output-dir is set
    #[arg(long, env = "DATA_DIR", default_value = "./data")]
    data_dir: PathBuf,

    /// Directory for Parquet batch files
    #[arg(long, short, env = "STREAM_DIR")]
    output_dir: Option<PathBuf>,

    /// Flush after this many events
    #[arg(long, default_value = "100", value_parser = clap::value_parser!(u64).range(1..=1_000_000))]
    max_batch_events: u64,

    /// Flush after this many seconds
    #[arg(long, default_value = "30", value_parser = clap::value_parser!(u64).range(1..))]
    max_batch_interval_secs: u64,

    /// Treat the connection as dead after this many silent seconds
    #[arg(long, default_value = "90", value_parser = clap::value_parser!(u64).range(1..))]
    read_timeout_secs: u64,

    /// Give up a connect cycle after retrying for this many seconds
    #[arg(long, default_value = "3600", value_parser = clap::value_parser!(u64).range(1..))]
    retry_budget_secs: u64,

    /// Parquet compression (none, snappy, lz4, zstd)
    #[arg(long, default_value = "snappy", value_parser = parse_compression)]
    compression: Compression,

    /// Kafka bootstrap brokers; forwarding is disabled when unset
    #[arg(long, env = "KAFKA_BROKER")]
    kafka_broker: Option<String>,

    /// Kafka topic
    #[arg(long, env = "KAFKA_TOPIC", default_value = "tweets")]
    kafka_topic: String,

    /// Records buffered for the bus forwarder
    #[arg(long, default_value = "10000", value_parser = clap::value_parser!(u64).range(1..=1_000_000))]
    bus_buffer: u64,

    /// Metrics HTTP server port (0 to disable)
    #[arg(long, env = "METRICS_PORT", default_value = "9090")]
    metrics_port: u16,
}

fn parse_compression(s: &str) -> std::result::Result<Compression, String> {
    Compression::parse(s).ok_or_else(|| format!("unknown compression '{}'", s))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("info".parse()?)
                .add_directive("firehose_ingest=debug".parse()?),
        )
        .init();

    let args = Args::parse();

    tracing::info!("Firehose ingestion daemon starting...");

    // Initialize metrics
    if args.metrics_port > 0 {
        let metrics_handle = init_metrics();
        start_metrics_server(args.metrics_port, metrics_handle)
            .await
            .with_context(|| format!("Failed to start metrics server on port {}", args.metrics_port))?;
        set_gauge("ingest_running", 1.0);
    }

    // Set up graceful shutdown
    let controller = LifecycleController::new();
    let signal_controller = controller.clone();
    ctrlc::set_handler(move || {
        signal_controller.request_shutdown();
    })
    .context("Failed to set Ctrl+C handler")?;

    let output_dir = args
        .output_dir
        .clone()
        .unwrap_or_else(|| args.data_dir.join("stream"));

    tracing::info!("Configuration:");
    tracing::info!("  Stream: {}", args.stream_url);
    tracing::info!("  Output: {}", output_dir.display());
    tracing::info!(
        "  Batches: {} events / {}s",
        args.max_batch_events,
        args.max_batch_interval_secs
    );
    tracing::info!(
        "  Kafka: {}",
        args.kafka_broker.as_deref().unwrap_or("disabled")
    );

    let stream_config = StreamConfig {
        url: args.stream_url.clone(),
        bearer_token: args.bearer_token.clone(),
        tweet_fields: args.tweet_fields.clone(),
        user_fields: args.user_fields.clone(),
        expansions: args.expansions.clone(),
        read_timeout: Duration::from_secs(args.read_timeout_secs),
        ..Default::default()
    };
    let retry = RetryPolicy {
        max_elapsed: Some(Duration::from_secs(args.retry_budget_secs)),
        ..Default::default()
    };
    let supervisor =
        StreamSupervisor::new(stream_config, retry).context("Failed to build HTTP client")?;

    let writer = ParquetBatchWriter::new(BatchWriterConfig {
        output_dir: output_dir.clone(),
        compression: args.compression,
        ..Default::default()
    })
    .with_context(|| format!("Failed to create output directory {}", output_dir.display()))?;

    let pipeline_config = PipelineConfig {
        flush: FlushPolicy {
            max_events: usize::try_from(args.max_batch_events)?,
            max_interval: Duration::from_secs(args.max_batch_interval_secs),
        },
        ..Default::default()
    };
    let forwarder_config = ForwarderConfig {
        capacity: usize::try_from(args.bus_buffer)?,
        ..Default::default()
    };

    // The bus forwarder is chosen once here; the loop only sees the trait.
    let result = match args.kafka_broker.as_deref() {
        #[cfg(feature = "kafka")]
        Some(broker) => {
            let kafka_config = KafkaConfig {
                brokers: broker.to_string(),
                topic: args.kafka_topic.clone(),
                ..Default::default()
            };
            match KafkaPublisher::new(kafka_config) {
                Ok(publisher) => {
                    let forwarder = ChannelForwarder::spawn(publisher, forwarder_config);
                    run(&controller, supervisor, writer, forwarder, pipeline_config).await
                }
                Err(e) => {
                    tracing::warn!("Kafka forwarding disabled: {}", e);
                    run(&controller, supervisor, writer, NoopForwarder, pipeline_config).await
                }
            }
        }
        #[cfg(not(feature = "kafka"))]
        Some(broker) => {
            tracing::warn!(
                "Kafka broker {} (topic {}, buffer {}) configured but this build lacks the `kafka` feature; forwarding disabled",
                broker,
                args.kafka_topic,
                forwarder_config.capacity
            );
            run(&controller, supervisor, writer, NoopForwarder, pipeline_config).await
        }
        None => run(&controller, supervisor, writer, NoopForwarder, pipeline_config).await,
    };

    set_gauge("ingest_running", 0.0);

    let stats = result.context("Ingestion stopped")?;
    print_summary(&stats);

    Ok(())
}

async fn run<F: BusForwarder>(
    controller: &LifecycleController,
    supervisor: StreamSupervisor,
    writer: ParquetBatchWriter,
    forwarder: F,
    config: PipelineConfig,
) -> firehose_ingest::Result<RunStats> {
    let bus = if forwarder.is_active() { "enabled" } else { "disabled" };
    tracing::info!("Bus forwarding {}", bus);
    controller
        .run(Pipeline::new(supervisor, writer, forwarder, config))
        .await
}

fn print_summary(stats: &RunStats) {
    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("SHUTDOWN COMPLETE");
    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("Lines read:           {}", stats.lines_read);
    tracing::info!("Lines skipped:        {}", stats.lines_skipped);
    tracing::info!("Events received:      {}", stats.events_received);
    tracing::info!("Batches written:      {}", stats.batches_written);
    tracing::info!("Events written:       {}", stats.events_written);
    tracing::info!("Write failures:       {}", stats.write_failures);
    tracing::info!("Events dropped:       {}", stats.events_dropped);
    tracing::info!("Connect restarts:     {}", stats.restarts);
    tracing::info!(
        "Bus:                  {} forwarded, {} failed, {} dropped, {} abandoned",
        stats.bus.forwarded,
        stats.bus.failed,
        stats.bus.dropped,
        stats.bus.abandoned
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_parse() {
        let args = Args::try_parse_from(["firehose-ingest"]).unwrap();
        assert_eq!(args.max_batch_events, 100);
        assert_eq!(args.max_batch_interval_secs, 30);
        assert_eq!(args.read_timeout_secs, 90);
        assert_eq!(args.bus_buffer, 10_000);
    }

    #[test]
    fn test_zero_and_oversized_limits_are_rejected() {
        for flag in [
            "--max-batch-events",
            "--max-batch-interval-secs",
            "--read-timeout-secs",
            "--retry-budget-secs",
            "--bus-buffer",
        ] {
            assert!(Args::try_parse_from(["firehose-ingest", flag, "0"]).is_err(), "{}", flag);
        }

        assert!(
            Args::try_parse_from(["firehose-ingest", "--max-batch-events", "18446744073709551615"])
                .is_err()
        );
        assert!(Args::try_parse_from(["firehose-ingest", "--bus-buffer", "1000001"]).is_err());
    }
}
