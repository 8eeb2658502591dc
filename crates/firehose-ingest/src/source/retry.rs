//! Retry policy for upstream connections.
//!
//! [`RetryPolicy`] describes exponential backoff with optional full jitter,
//! bounded by an optional total time budget. [`retry_connect`] drives a
//! connection attempt through that policy while keeping the shared
//! [`ConnectionState`] up to date.
//!
//! ```text
//! cap(n)   = min(base_delay * 2^n, max_delay)
//! delay(n) = random(0 ..= cap(n))      with Jitter::Full
//!          = cap(n)                    with Jitter::None
//! ```

use super::state::{ConnectionState, SharedConnectionState};
use crate::{Error, Result};

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Randomization applied to each backoff delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Jitter {
    /// Uniform in `[0, cap]`.
    #[default]
    Full,
    /// Exactly `cap`.
    None,
}

/// Exponential backoff configuration.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay cap for the first retry.
    pub base_delay: Duration,

    /// Upper bound on any single delay.
    pub max_delay: Duration,

    /// Total time allowed for retrying. `None` retries forever.
    pub max_elapsed: Option<Duration>,

    /// Jitter strategy.
    pub jitter: Jitter,
}

impl Default for RetryPolicy {
    /// Upstream connect policy: 1s doubling to 5 min, full jitter, one hour
    /// budget.
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            max_elapsed: Some(Duration::from_secs(3600)),
            jitter: Jitter::Full,
        }
    }
}

impl RetryPolicy {
    /// Policy for restarting a whole connect cycle: 1s doubling to 5 min,
    /// deterministic, unbounded.
    pub fn restart() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            max_elapsed: None,
            jitter: Jitter::None,
        }
    }

    /// Backoff cap before jitter for the given zero-based retry number.
    pub fn backoff_cap(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Delay before the given zero-based retry.
    pub fn delay(&self, retry: u32) -> Duration {
        let cap = self.backoff_cap(retry);
        match self.jitter {
            Jitter::None => cap,
            Jitter::Full => {
                let cap_ms = u64::try_from(cap.as_millis()).unwrap_or(u64::MAX);
                Duration::from_millis(rand::rng().random_range(0..=cap_ms))
            }
        }
    }

    /// Whether a failed attempt should be retried under this policy.
    pub fn is_retryable(&self, error: &Error) -> bool {
        error.is_retryable()
    }

    /// Begin a retry sequence.
    pub fn start(&self) -> Backoff {
        Backoff {
            policy: self.clone(),
            retries: 0,
            started: Instant::now(),
        }
    }
}

/// Progress through one retry sequence.
#[derive(Debug)]
pub struct Backoff {
    policy: RetryPolicy,
    retries: u32,
    started: Instant,
}

impl Backoff {
    /// Delay before the next retry, or `None` once the budget is spent.
    ///
    /// The final delay is truncated so the sequence never sleeps past the
    /// budget.
    pub fn next_delay(&mut self) -> Option<Duration> {
        let elapsed = self.started.elapsed();
        let mut delay = self.policy.delay(self.retries);

        if let Some(budget) = self.policy.max_elapsed {
            if elapsed >= budget {
                return None;
            }
            delay = delay.min(budget - elapsed);
        }

        self.retries = self.retries.saturating_add(1);
        Some(delay)
    }

    /// Retries scheduled so far.
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Time since the sequence started.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Start over, as after a healthy session.
    pub fn reset(&mut self) {
        self.retries = 0;
        self.started = Instant::now();
    }
}

/// Run `attempt` until it succeeds, fails permanently, exhausts the policy,
/// or shutdown is requested.
///
/// State transitions: `Connecting` before each attempt, `Streaming` on
/// success, `Backoff` while waiting, `Disconnected` on any terminal failure.
pub async fn retry_connect<T, F, Fut>(
    policy: &RetryPolicy,
    state: &SharedConnectionState,
    shutdown: &CancellationToken,
    mut attempt: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut backoff = policy.start();

    loop {
        if shutdown.is_cancelled() {
            state.set(ConnectionState::Disconnected);
            return Err(Error::Cancelled);
        }

        state.set(ConnectionState::Connecting);
        metrics::counter!("stream_connect_attempts_total").increment(1);

        let outcome = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                state.set(ConnectionState::Disconnected);
                return Err(Error::Cancelled);
            }
            outcome = attempt() => outcome,
        };

        let error = match outcome {
            Ok(value) => {
                state.set(ConnectionState::Streaming);
                return Ok(value);
            }
            Err(e) if !policy.is_retryable(&e) => {
                state.set(ConnectionState::Disconnected);
                return Err(e);
            }
            Err(e) => e,
        };

        metrics::counter!("stream_connect_failures_total").increment(1);

        let Some(delay) = backoff.next_delay() else {
            state.set(ConnectionState::Disconnected);
            return Err(Error::ConnectionExhausted {
                attempts: backoff.retries() + 1,
                elapsed: backoff.elapsed(),
                last_error: error.to_string(),
            });
        };

        state.set(ConnectionState::Backoff);
        tracing::warn!(
            "Upstream connection failed (retry {}), backing off {:?}: {}",
            backoff.retries(),
            delay,
            error
        );

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                state.set(ConnectionState::Disconnected);
                return Err(Error::Cancelled);
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
