//! Parquet batch writer.
//!
//! Each flushed [`Batch`] becomes one Parquet file holding the flat
//! [`EventRow`] projection of its events:
//!
//! ```text
//! <output_dir>/tweets_20240501T120000.parquet
//! <output_dir>/tweets_20240501T120000-1.parquet   (second flush in the same second)
//! ```
//!
//! Files are written under a `.tmp` name and renamed into place, so readers
//! never observe a partial file.

use super::batch::Batch;
use crate::Result;

use arrow::array::{ArrayRef, StringArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use firehose_core::EventRow;
use parquet::arrow::ArrowWriter;
use parquet::file::properties::WriterProperties;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Parquet compression codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    /// No compression
    None,
    /// Snappy compression (fast, moderate ratio)
    #[default]
    Snappy,
    /// LZ4 compression (very fast, lower ratio)
    Lz4,
    /// Zstd compression (slower, best ratio)
    Zstd,
}

impl Compression {
    /// Convert to parquet compression type
    pub fn to_parquet(self) -> parquet::basic::Compression {
        match self {
            Self::None => parquet::basic::Compression::UNCOMPRESSED,
            Self::Snappy => parquet::basic::Compression::SNAPPY,
            Self::Lz4 => parquet::basic::Compression::LZ4,
            Self::Zstd => parquet::basic::Compression::ZSTD(Default::default()),
        }
    }

    /// Parse from string representation
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "none" | "uncompressed" => Some(Self::None),
            "snappy" => Some(Self::Snappy),
            "lz4" => Some(Self::Lz4),
            "zstd" => Some(Self::Zstd),
            _ => None,
        }
    }
}

/// Configuration for the batch writer.
#[derive(Debug, Clone)]
pub struct BatchWriterConfig {
    /// Directory that receives batch files. Created if missing.
    pub output_dir: PathBuf,

    /// File name prefix.
    /// Default: "tweets"
    pub file_prefix: String,

    /// Column compression.
    pub compression: Compression,
}

impl Default for BatchWriterConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./data/stream"),
            file_prefix: "tweets".to_string(),
            compression: Compression::default(),
        }
    }
}

/// A batch file that was written successfully.
#[derive(Debug, Clone)]
pub struct WrittenBatch {
    /// Final location of the file.
    pub path: PathBuf,

    /// Rows in the file.
    pub event_count: usize,

    /// File size on disk.
    pub bytes: u64,

    /// Flush timestamp the file is named after.
    pub written_at: DateTime<Utc>,
}

/// Destination for flushed batches.
pub trait BatchSink: Send {
    /// Persist a batch.
    ///
    /// Returns `Ok(None)` without touching storage when the batch is empty.
    fn write(&mut self, batch: &Batch) -> Result<Option<WrittenBatch>>;
}

/// Writes each batch to its own Parquet file.
pub struct ParquetBatchWriter {
    config: BatchWriterConfig,
    schema: SchemaRef,
}

impl ParquetBatchWriter {
    /// Create a writer, creating the output directory if needed.
    pub fn new(config: BatchWriterConfig) -> Result<Self> {
        fs::create_dir_all(&config.output_dir)?;
        tracing::info!(
            "Writing batches to {} ({:?} compression)",
            config.output_dir.display(),
            config.compression
        );

        Ok(Self {
            config,
            schema: event_schema(),
        })
    }

    pub fn output_dir(&self) -> &Path {
        &self.config.output_dir
    }

    /// Write a batch named after `now`.
    pub fn write_at(&mut self, batch: &Batch, now: DateTime<Utc>) -> Result<Option<WrittenBatch>> {
        if batch.is_empty() {
            return Ok(None);
        }

        let rows: Vec<EventRow> = batch.events.iter().map(EventRow::from).collect();
        let record_batch = rows_to_record_batch(&rows, Arc::clone(&self.schema))?;

        let path = self.unique_path(&now);
        let tmp_path = path.with_extension("parquet.tmp");

        if let Err(e) = self.write_file(&tmp_path, &record_batch) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e);
        }
        fs::rename(&tmp_path, &path)?;

        let bytes = fs::metadata(&path)?.len();

        tracing::info!("Wrote {} events -> {}", rows.len(), path.display());

        Ok(Some(WrittenBatch {
            path,
            event_count: rows.len(),
            bytes,
            written_at: now,
        }))
    }

    fn write_file(&self, path: &Path, record_batch: &RecordBatch) -> Result<()> {
        let file = File::create(path)?;
        let props = WriterProperties::builder()
            .set_compression(self.config.compression.to_parquet())
            .build();

        let mut writer = ArrowWriter::try_new(file, Arc::clone(&self.schema), Some(props))?;
        writer.write(record_batch)?;
        let file = writer.into_inner()?;
        file.sync_all()?;
        Ok(())
    }

    /// First free name for this second: the bare timestamp, then `-1`, `-2`, ...
    fn unique_path(&self, now: &DateTime<Utc>) -> PathBuf {
        let stem = format!(
            "{}_{}",
            self.config.file_prefix,
            now.format("%Y%m%dT%H%M%S")
        );

        let candidate = self.config.output_dir.join(format!("{}.parquet", stem));
        if !candidate.exists() {
            return candidate;
        }

        let mut n = 1u32;
        loop {
            let candidate = self
                .config
                .output_dir
                .join(format!("{}-{}.parquet", stem, n));
            if !candidate.exists() {
                return candidate;
            }
            n += 1;
        }
    }
}

impl BatchSink for ParquetBatchWriter {
    fn write(&mut self, batch: &Batch) -> Result<Option<WrittenBatch>> {
        self.write_at(batch, Utc::now())
    }
}

/// Arrow schema of batch files: every [`EventRow`] column as nullable UTF-8.
pub fn event_schema() -> SchemaRef {
    let fields: Vec<Field> = EventRow::COLUMNS
        .iter()
        .map(|name| Field::new(*name, DataType::Utf8, true))
        .collect();
    Arc::new(Schema::new(fields))
}

fn rows_to_record_batch(rows: &[EventRow], schema: SchemaRef) -> Result<RecordBatch> {
    let columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from_iter(rows.iter().map(|r| r.id.as_deref()))),
        Arc::new(StringArray::from_iter(rows.iter().map(|r| r.text.as_deref()))),
        Arc::new(StringArray::from_iter(rows.iter().map(|r| r.author_id.as_deref()))),
        Arc::new(StringArray::from_iter(rows.iter().map(|r| r.created_at.as_deref()))),
        Arc::new(StringArray::from_iter(rows.iter().map(|r| r.lang.as_deref()))),
        Arc::new(StringArray::from_iter(rows.iter().map(|r| r.user_username.as_deref()))),
        Arc::new(StringArray::from_iter(rows.iter().map(|r| r.user_name.as_deref()))),
    ];

    Ok(RecordBatch::try_new(schema, columns)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::BatchAccumulator;
    use crate::pipeline::FlushPolicy;
    use arrow::array::Array;
    use chrono::TimeZone;
    use firehose_core::Event;
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use tempfile::TempDir;

    fn batch_of(lines: &[&str]) -> Batch {
        let mut acc = BatchAccumulator::new(FlushPolicy::default());
        for line in lines {
            acc.append(Event::from_json(line).unwrap());
        }
        acc.take_and_reset()
    }

    fn writer_in(dir: &TempDir) -> ParquetBatchWriter {
        ParquetBatchWriter::new(BatchWriterConfig {
            output_dir: dir.path().join("stream"),
            ..Default::default()
        })
        .unwrap()
    }

    fn read_back(path: &Path) -> Vec<RecordBatch> {
        let file = File::open(path).unwrap();
        ParquetRecordBatchReaderBuilder::try_new(file)
            .unwrap()
            .build()
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap()
    }

    fn string_column(batch: &RecordBatch, name: &str) -> Vec<Option<String>> {
        let array = batch
            .column_by_name(name)
            .unwrap()
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        (0..array.len())
            .map(|i| (!array.is_null(i)).then(|| array.value(i).to_string()))
            .collect()
    }

    fn at(secs: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, secs).unwrap()
    }

    // =========================================================================
    // Compression
    // =========================================================================

    #[test]
    fn test_compression_parse() {
        assert_eq!(Compression::parse("none"), Some(Compression::None));
        assert_eq!(Compression::parse("SNAPPY"), Some(Compression::Snappy));
        assert_eq!(Compression::parse("lz4"), Some(Compression::Lz4));
        assert_eq!(Compression::parse("zstd"), Some(Compression::Zstd));
        assert_eq!(Compression::parse("brotli"), None);
        assert_eq!(Compression::default(), Compression::Snappy);
    }

    // =========================================================================
    // Writing
    // =========================================================================

    #[test]
    fn test_creates_output_dir() {
        let dir = TempDir::new().unwrap();
        let writer = writer_in(&dir);
        assert!(writer.output_dir().is_dir());
    }

    #[test]
    fn test_empty_batch_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let mut writer = writer_in(&dir);

        let result = writer.write_at(&batch_of(&[]), at(0)).unwrap();
        assert!(result.is_none());
        assert_eq!(fs::read_dir(writer.output_dir()).unwrap().count(), 0);
    }

    #[test]
    fn test_writes_flat_rows_with_nulls() {
        let dir = TempDir::new().unwrap();
        let mut writer = writer_in(&dir);

        let batch = batch_of(&[
            r#"{"data":{"id":"1","text":"hello","author_id":"10","created_at":"2024-05-01T12:00:00.000Z","lang":"en"},
                "includes":{"users":[{"id":"10","username":"alice","name":"Alice"}]}}"#,
            r#"{"data":{"id":"2","text":"no author"}}"#,
        ]);

        let written = writer.write_at(&batch, at(0)).unwrap().unwrap();
        assert_eq!(written.event_count, 2);
        assert!(written.bytes > 0);
        assert_eq!(
            written.path.file_name().unwrap().to_str().unwrap(),
            "tweets_20240501T120000.parquet"
        );

        let batches = read_back(&written.path);
        assert_eq!(batches.len(), 1);
        let rb = &batches[0];
        assert_eq!(rb.num_rows(), 2);
        assert_eq!(rb.schema().fields().len(), EventRow::COLUMNS.len());

        assert_eq!(
            string_column(rb, "id"),
            vec![Some("1".to_string()), Some("2".to_string())]
        );
        assert_eq!(
            string_column(rb, "user_username"),
            vec![Some("alice".to_string()), None]
        );
        assert_eq!(
            string_column(rb, "user_name"),
            vec![Some("Alice".to_string()), None]
        );
        assert_eq!(string_column(rb, "lang"), vec![Some("en".to_string()), None]);
    }

    #[test]
    fn test_same_second_flushes_get_distinct_files() {
        let dir = TempDir::new().unwrap();
        let mut writer = writer_in(&dir);
        let batch = batch_of(&[r#"{"data":{"id":"1"}}"#]);

        let first = writer.write_at(&batch, at(5)).unwrap().unwrap();
        let second = writer.write_at(&batch, at(5)).unwrap().unwrap();
        let third = writer.write_at(&batch, at(5)).unwrap().unwrap();

        assert_eq!(
            first.path.file_name().unwrap().to_str().unwrap(),
            "tweets_20240501T120005.parquet"
        );
        assert_eq!(
            second.path.file_name().unwrap().to_str().unwrap(),
            "tweets_20240501T120005-1.parquet"
        );
        assert_eq!(
            third.path.file_name().unwrap().to_str().unwrap(),
            "tweets_20240501T120005-2.parquet"
        );
        assert_eq!(fs::read_dir(writer.output_dir()).unwrap().count(), 3);
    }

    #[test]
    fn test_no_tmp_files_left_behind() {
        let dir = TempDir::new().unwrap();
        let mut writer = writer_in(&dir);
        writer
            .write_at(&batch_of(&[r#"{"data":{"id":"1"}}"#]), at(0))
            .unwrap();

        let names: Vec<String> = fs::read_dir(writer.output_dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["tweets_20240501T120000.parquet".to_string()]);
    }

    #[test]
    fn test_write_fails_when_dir_removed() {
        let dir = TempDir::new().unwrap();
        let mut writer = writer_in(&dir);
        fs::remove_dir_all(writer.output_dir()).unwrap();

        let result = writer.write_at(&batch_of(&[r#"{"data":{"id":"1"}}"#]), at(0));
        assert!(result.is_err());
        assert!(!writer.output_dir().exists());
    }
}
