use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use cell_config::MissionSettings;
use thiserror::Error;
use tracing::debug;

/// Shared cooperative stop flag.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Creates a cleared flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests a stop.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Clears a previous request.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    /// Whether a stop was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Bounded retry settings for a single remote call.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts including the first one.
    pub max_attempts: u32,
    /// Pause after each failed attempt that will be retried.
    pub backoff: Duration,
    /// Stops retrying between attempts when set.
    pub cancel: Option<CancelFlag>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            backoff: Duration::from_secs(1),
            cancel: None,
        }
    }
}

impl RetryPolicy {
    /// Policy with explicit attempts and backoff.
    #[must_use]
    pub const fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts,
            backoff,
            cancel: None,
        }
    }

    /// Attaches a cancel flag checked between attempts.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

impl From<&MissionSettings> for RetryPolicy {
    fn from(settings: &MissionSettings) -> Self {
        Self::new(
            settings.retry_attempts,
            Duration::from_millis(settings.retry_backoff_ms),
        )
    }
}

/// Why a retried call produced no value.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RetryError<E> {
    /// Every attempt failed.
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// Error of the final attempt.
        last: E,
    },
    /// The error was not worth retrying.
    #[error("not retried after attempt {attempts}: {error}")]
    Fatal {
        /// Attempts made.
        attempts: u32,
        /// The error.
        error: E,
    },
    /// The cancel flag was raised between attempts.
    #[error("cancelled after {attempts} attempts")]
    Cancelled {
        /// Attempts made.
        attempts: u32,
    },
}

impl<E> RetryError<E> {
    /// Attempts made before giving up.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. }
            | Self::Fatal { attempts, .. }
            | Self::Cancelled { attempts } => *attempts,
        }
    }

    /// Last error observed, if any.
    #[must_use]
    pub fn into_last(self) -> Option<E> {
        match self {
            Self::Exhausted { last, .. } => Some(last),
            Self::Fatal { error, .. } => Some(error),
            Self::Cancelled { .. } => None,
        }
    }
}

/// Runs `op` up to `policy.max_attempts` times, sleeping `policy.backoff`
/// after every failed attempt except the last. The closure receives the
/// one-based attempt number.
pub async fn with_retry<T, E, F, Fut>(policy: &RetryPolicy, op: F) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    with_retry_when(policy, |_| true, op).await
}

/// Like [`with_retry`], but stops at the first error `retryable` rejects.
pub async fn with_retry_when<T, E, F, Fut, R>(
    policy: &RetryPolicy,
    retryable: R,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        if policy.cancel.as_ref().is_some_and(CancelFlag::is_cancelled) {
            return Err(RetryError::Cancelled { attempts: attempt });
        }
        attempt += 1;
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) if !retryable(&error) => {
                return Err(RetryError::Fatal {
                    attempts: attempt,
                    error,
                })
            }
            Err(last) if attempt >= max_attempts => {
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last,
                })
            }
            Err(_) => {
                debug!(attempt, max_attempts, "remote call failed, backing off");
                tokio::time::sleep(policy.backoff).await;
            }
        }
    }
}
