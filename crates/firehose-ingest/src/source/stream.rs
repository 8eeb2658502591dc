//! HTTP streaming connection to the upstream feed.
//!
//! [`StreamSupervisor`] issues the authenticated streaming request and
//! retries it under its [`RetryPolicy`]. The response body is exposed as an
//! [`HttpRecordStream`] of raw lines.
//!
//! The feed sends newline-delimited JSON with blank keep-alive lines. A
//! connection that produces no bytes at all for `read_timeout` is treated as
//! dead.

use super::retry::{RetryPolicy, retry_connect};
use super::state::{ConnectionState, SharedConnectionState};
use super::{Connector, RecordStream};
use crate::{Error, Result};

use bytes::Bytes;
use futures::{Stream, StreamExt, TryStreamExt};
use std::io;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::{Instant, Sleep};
use tokio_util::codec::{AnyDelimiterCodec, FramedRead};
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

/// Longest line accepted from the feed.
const MAX_LINE_BYTES: usize = 8 * 1024 * 1024;

/// Leading characters of an error response kept for logging.
const ERROR_BODY_CHARS: usize = 200;

/// Most bytes read from an error response body.
const ERROR_BODY_BYTES: usize = 4 * 1024;

/// Configuration for the upstream connection.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Streaming endpoint.
    pub url: String,

    /// Bearer credential. Connecting fails with [`Error::Auth`] when unset.
    pub bearer_token: Option<String>,

    /// `tweet.fields` query parameter.
    pub tweet_fields: String,

    /// `user.fields` query parameter.
    pub user_fields: String,

    /// `expansions` query parameter.
    pub expansions: String,

    /// TCP connect timeout.
    pub connect_timeout: Duration,

    /// Longest silence tolerated on an open connection.
    pub read_timeout: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: "https://api.x.com/2/tweets/sample/stream".to_string(),
            bearer_token: None,
            tweet_fields: "id,text,author_id,created_at,lang,public_metrics,possibly_sensitive,source"
                .to_string(),
            user_fields: "username,name,public_metrics,verified,created_at".to_string(),
            expansions: "author_id".to_string(),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(90),
        }
    }
}

/// Owns the retrying upstream session.
pub struct StreamSupervisor {
    config: StreamConfig,
    policy: RetryPolicy,
    client: reqwest::Client,
    state: SharedConnectionState,
}

impl StreamSupervisor {
    /// Create a supervisor. Does not connect.
    pub fn new(config: StreamConfig, policy: RetryPolicy) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .user_agent(concat!("firehose-ingest/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            config,
            policy,
            client,
            state: SharedConnectionState::new(),
        })
    }

    /// One connection attempt.
    async fn open(&self, token: &str) -> Result<HttpRecordStream> {
        let mut params: Vec<(&str, &str)> = Vec::with_capacity(3);
        for (key, value) in [
            ("tweet.fields", &self.config.tweet_fields),
            ("user.fields", &self.config.user_fields),
            ("expansions", &self.config.expansions),
        ] {
            if !value.is_empty() {
                params.push((key, value.as_str()));
            }
        }

        let request = self
            .client
            .get(&self.config.url)
            .bearer_auth(token)
            .query(&params)
            .send();

        let response = tokio::time::timeout(self.config.read_timeout, request)
            .await
            .map_err(|_| Error::ReadTimeout(self.config.read_timeout))??;

        let status = response.status();
        if status.as_u16() >= 400 {
            return Err(Error::Http {
                status: status.as_u16(),
                body: error_body(response, self.config.read_timeout).await,
            });
        }

        tracing::info!("Connected to upstream feed ({})", status);
        Ok(HttpRecordStream::new(response, self.config.read_timeout))
    }
}

/// Read the head of an error response, bounded in size and time.
async fn error_body(mut response: reqwest::Response, limit: Duration) -> String {
    let mut body = Vec::new();
    let read = async {
        while body.len() < ERROR_BODY_BYTES {
            match response.chunk().await {
                Ok(Some(chunk)) => body.extend_from_slice(&chunk),
                _ => break,
            }
        }
    };
    if tokio::time::timeout(limit, read).await.is_err() {
        tracing::debug!("Error response body stalled after {} bytes", body.len());
    }

    String::from_utf8_lossy(&body)
        .chars()
        .take(ERROR_BODY_CHARS)
        .collect()
}

impl Connector for StreamSupervisor {
    type Stream = HttpRecordStream;

    async fn connect(&mut self, shutdown: &CancellationToken) -> Result<HttpRecordStream> {
        let token = match self.config.bearer_token.as_deref().map(str::trim) {
            Some(token) if !token.is_empty() => token,
            _ => {
                self.state.set(ConnectionState::Disconnected);
                return Err(Error::Auth("bearer token is not set".to_string()));
            }
        };

        let this = &*self;
        retry_connect(&this.policy, &this.state, shutdown, move || this.open(token)).await
    }

    fn connection_state(&self) -> &SharedConnectionState {
        &self.state
    }
}

type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Raw lines from one open HTTP response.
pub struct HttpRecordStream {
    frames: FramedRead<StreamReader<ByteStream, Bytes>, AnyDelimiterCodec>,
    idle: Pin<Box<Sleep>>,
    read_timeout: Duration,
}

impl HttpRecordStream {
    fn new(response: reqwest::Response, read_timeout: Duration) -> Self {
        Self::from_byte_stream(response.bytes_stream().map_err(io::Error::other), read_timeout)
    }

    /// Wrap an arbitrary byte stream.
    pub(crate) fn from_byte_stream<S>(bytes: S, read_timeout: Duration) -> Self
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        let bytes: ByteStream = Box::pin(bytes);
        let codec = AnyDelimiterCodec::new_with_max_length(b"\n".to_vec(), Vec::new(), MAX_LINE_BYTES);

        Self {
            frames: FramedRead::new(StreamReader::new(bytes), codec),
            idle: Box::pin(tokio::time::sleep(read_timeout)),
            read_timeout,
        }
    }
}

impl RecordStream for HttpRecordStream {
    async fn next_line(&mut self) -> Result<Option<String>> {
        let frame = tokio::select! {
            frame = self.frames.next() => frame,
            _ = &mut self.idle => return Err(Error::ReadTimeout(self.read_timeout)),
        };

        match frame {
            None => Ok(None),
            Some(Ok(line)) => {
                self.idle.as_mut().reset(Instant::now() + self.read_timeout);
                Ok(Some(String::from_utf8_lossy(&line).into_owned()))
            }
            Some(Err(e)) => Err(Error::Io(io::Error::other(e))),
        }
    }
}
