//! Upstream feed connection.
//!
//! This module owns everything between the network and the ingestion loop:
//! opening the authenticated streaming request, retrying it under a
//! [`RetryPolicy`], and splitting the response body into raw lines.
//!
//! # Architecture
//!
//! The ingestion loop talks to the feed only through the [`Connector`] and
//! [`RecordStream`] traits. [`StreamSupervisor`] is the HTTP implementation;
//! tests substitute scripted in-memory connectors.
//!
//! ```text
//! Connector::connect ──► RecordStream::next_line ──► Some(line) ...
//!        │                         │
//!   retry_connect             None / Err ──► loop reconnects
//! ```

mod retry;
mod state;
mod stream;

pub use retry::{Backoff, Jitter, RetryPolicy, retry_connect};
pub use state::{ConnectionState, SharedConnectionState};
pub use stream::{HttpRecordStream, StreamConfig, StreamSupervisor};

use crate::Result;
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// A live sequence of raw lines from one upstream session.
pub trait RecordStream: Send {
    /// Read the next raw line.
    ///
    /// Returns `Ok(None)` when the upstream closes the session cleanly.
    ///
    /// Must be cancel safe: dropping the returned future before it completes
    /// must not lose a line that a later call would have returned.
    fn next_line(&mut self) -> impl Future<Output = Result<Option<String>>> + Send;
}

/// Opens upstream sessions.
pub trait Connector: Send {
    /// Session type produced by a successful connect.
    type Stream: RecordStream;

    /// Establish a session, retrying transient failures.
    ///
    /// Returns [`Error::Cancelled`](crate::Error::Cancelled) if `shutdown`
    /// fires before a session is established.
    fn connect(
        &mut self,
        shutdown: &CancellationToken,
    ) -> impl Future<Output = Result<Self::Stream>> + Send;

    /// Shared view of this connector's state.
    fn connection_state(&self) -> &SharedConnectionState;
}
