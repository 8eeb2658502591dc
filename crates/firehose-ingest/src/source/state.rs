//! Upstream connection state, shared between the supervisor and observers.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

/// Where the upstream session currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Streaming = 2,
    Backoff = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Streaming,
            3 => Self::Backoff,
            _ => Self::Disconnected,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Streaming => "streaming",
            Self::Backoff => "backoff",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cloneable handle to the current [`ConnectionState`].
///
/// Written only by the connection owner; read from anywhere.
#[derive(Debug, Clone)]
pub struct SharedConnectionState {
    inner: Arc<AtomicU8>,
}

impl Default for SharedConnectionState {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedConnectionState {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(AtomicU8::new(ConnectionState::Disconnected as u8)),
        }
    }

    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.inner.load(Ordering::Acquire))
    }

    /// Record a transition. Returns the previous state.
    pub fn set(&self, state: ConnectionState) -> ConnectionState {
        let previous = ConnectionState::from_u8(self.inner.swap(state as u8, Ordering::AcqRel));
        if previous != state {
            tracing::debug!("Connection state: {} -> {}", previous, state);
            metrics::gauge!("stream_connection_state").set(f64::from(state as u8));
        }
        previous
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_disconnected() {
        assert_eq!(SharedConnectionState::new().get(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_set_returns_previous() {
        let state = SharedConnectionState::new();
        assert_eq!(state.set(ConnectionState::Connecting), ConnectionState::Disconnected);
        assert_eq!(state.set(ConnectionState::Streaming), ConnectionState::Connecting);
        assert_eq!(state.get(), ConnectionState::Streaming);
    }

    #[test]
    fn test_clones_share_state() {
        let state = SharedConnectionState::new();
        let observer = state.clone();
        state.set(ConnectionState::Backoff);
        assert_eq!(observer.get(), ConnectionState::Backoff);
    }

    #[test]
    fn test_round_trip_all_states() {
        for s in [
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::Streaming,
            ConnectionState::Backoff,
        ] {
            assert_eq!(ConnectionState::from_u8(s as u8), s);
        }
    }
}
