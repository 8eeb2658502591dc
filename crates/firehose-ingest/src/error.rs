//! Error types for the ingestion pipeline.

use std::time::Duration;
use thiserror::Error;

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during ingestion.
#[derive(Error, Debug)]
pub enum Error {
    /// Missing or unusable credential. Never retried.
    #[error("authentication error: {0}")]
    Auth(String),

    /// Upstream answered with an error status.
    #[error("HTTP {status}: {body}")]
    Http {
        /// Response status code.
        status: u16,
        /// Leading part of the response body.
        body: String,
    },

    /// Network-level failure talking to the upstream feed.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// No bytes arrived within the read timeout.
    #[error("no data received for {0:?}")]
    ReadTimeout(Duration),

    /// The retry budget ran out before a connection was established.
    #[error("connection retries exhausted after {attempts} attempts in {elapsed:?}: {last_error}")]
    ConnectionExhausted {
        /// Connection attempts made.
        attempts: u32,
        /// Time spent retrying.
        elapsed: Duration,
        /// Error from the final attempt.
        last_error: String,
    },

    /// Shutdown was requested while the operation was in progress.
    #[error("operation cancelled by shutdown")]
    Cancelled,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Parquet encoding error.
    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    /// Arrow conversion error.
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    /// Message bus error.
    #[error("message bus error: {0}")]
    Bus(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Error from the core crate.
    #[error(transparent)]
    Core(#[from] firehose_core::Error),
}

impl Error {
    /// Whether a connection attempt that failed with this error should be
    /// retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Http { status, .. } if *status >= 400
        ) || matches!(
            self,
            Self::Transport(_) | Self::ReadTimeout(_) | Self::Io(_)
        )
    }

    /// Whether this error must terminate the process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Auth(_) | Self::Config(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_errors_are_retryable() {
        for status in [400u16, 401, 403, 429, 500, 503] {
            let err = Error::Http {
                status,
                body: String::new(),
            };
            assert!(err.is_retryable(), "status {} should be retryable", status);
            assert!(!err.is_fatal());
        }
    }

    #[test]
    fn test_auth_is_fatal_and_not_retryable() {
        let err = Error::Auth("bearer token is not set".to_string());
        assert!(!err.is_retryable());
        assert!(err.is_fatal());
    }

    #[test]
    fn test_read_timeout_is_retryable() {
        assert!(Error::ReadTimeout(Duration::from_secs(90)).is_retryable());
    }

    #[test]
    fn test_exhausted_and_cancelled_are_neither() {
        let exhausted = Error::ConnectionExhausted {
            attempts: 12,
            elapsed: Duration::from_secs(3600),
            last_error: "HTTP 503: busy".to_string(),
        };
        assert!(!exhausted.is_retryable());
        assert!(!exhausted.is_fatal());
        assert!(!Error::Cancelled.is_retryable());
        assert!(!Error::Cancelled.is_fatal());
    }

    #[test]
    fn test_exhausted_display() {
        let err = Error::ConnectionExhausted {
            attempts: 3,
            elapsed: Duration::from_secs(2),
            last_error: "HTTP 500: oops".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("3 attempts"));
        assert!(msg.contains("HTTP 500: oops"));
    }

    #[test]
    fn test_http_display() {
        let err = Error::Http {
            status: 429,
            body: "Too Many Requests".to_string(),
        };
        assert_eq!(err.to_string(), "HTTP 429: Too Many Requests");
    }
}
