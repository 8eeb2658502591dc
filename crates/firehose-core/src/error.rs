//! Error types shared by the firehose crates.

use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while handling stream records.
#[derive(Error, Debug)]
pub enum Error {
    /// JSON parsing or encoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A record parsed as JSON but does not have the expected structure.
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
