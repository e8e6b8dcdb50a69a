//! Retry with exponential backoff
//!
//! Shared by the index builder (page and count requests) and the download
//! workers. Delays grow by `backoff_multiplier` up to `max_delay`, optionally
//! jittered so workers hitting the same rate-limited portal do not retry in
//! lockstep. [`FetchError::Permanent`] ends the loop after the first attempt.
//!
//! # Example
//!
//! ```no_run
//! use filing_dl::FetchError;
//! use filing_dl::config::RetryConfig;
//! use filing_dl::retry::retry_with_backoff;
//!
//! # async fn example() {
//! let config = RetryConfig::default();
//! let outcome = retry_with_backoff(&config, None, |attempt| async move {
//!     if attempt < 2 {
//!         Err(FetchError::transient("HTTP 503"))
//!     } else {
//!         Ok(attempt)
//!     }
//! })
//! .await;
//! assert_eq!(outcome.attempts, 2);
//! # }
//! ```

use crate::config::RetryConfig;
use crate::error::{Error, FetchError};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (timeouts, 5xx, rate limiting, challenge pages) return `true`.
/// Permanent failures (404, malformed URL, bad config) return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for FetchError {
    fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::Network(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::Interrupted
            ),
            Error::Fetch(e) => e.is_retryable(),
            // Unparsable portal responses are usually an anti-bot page or a hiccup
            Error::Search(_) | Error::Serialization(_) => true,
            Error::Config { .. }
            | Error::InvalidDateRange(_)
            | Error::IndexRead { .. }
            | Error::ReportWrite { .. }
            | Error::Csv(_)
            | Error::ShuttingDown
            | Error::Other(_) => false,
        }
    }
}

/// Result of a retried operation together with how many attempts it took
#[derive(Debug)]
pub struct Attempted<T, E> {
    /// Final result (last error when every attempt failed)
    pub result: Result<T, E>,
    /// Number of times the operation was invoked
    pub attempts: u32,
    /// Whether a cancellation interrupted the retry loop during backoff
    pub cancelled: bool,
}

/// Execute an async operation with exponential backoff retry logic
///
/// The operation receives the 1-based attempt number. It is invoked at most
/// `config.max_attempts` times; permanent errors stop the loop immediately.
/// When `cancel` fires during a backoff sleep the loop stops and the last error
/// is returned with `cancelled = true`.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    cancel: Option<&CancellationToken>,
    mut operation: F,
) -> Attempted<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + std::fmt::Display,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match operation(attempt).await {
            Ok(result) => {
                if attempt > 1 {
                    tracing::info!(attempts = attempt, "Operation succeeded after retry");
                }
                return Attempted {
                    result: Ok(result),
                    attempts: attempt,
                    cancelled: false,
                };
            }
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                let delay = backoff_delay(config, attempt);

                tracing::warn!(
                    error = %e,
                    attempt = attempt,
                    max_attempts = max_attempts,
                    delay_ms = delay.as_millis(),
                    "Operation failed, retrying"
                );

                match cancel {
                    Some(token) => {
                        tokio::select! {
                            _ = token.cancelled() => {
                                return Attempted {
                                    result: Err(e),
                                    attempts: attempt,
                                    cancelled: true,
                                };
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    None => tokio::time::sleep(delay).await,
                }
            }
            Err(e) => {
                if e.is_retryable() {
                    tracing::error!(
                        error = %e,
                        attempts = attempt,
                        "Operation failed after all retry attempts exhausted"
                    );
                } else {
                    tracing::error!(error = %e, "Operation failed with non-retryable error");
                }
                return Attempted {
                    result: Err(e),
                    attempts: attempt,
                    cancelled: false,
                };
            }
        }
    }
}

/// Delay to wait after the given failed attempt (1-based)
///
/// `initial_delay * multiplier^(attempt-1)`, capped at `max_delay`, then jittered
/// when the config asks for it.
pub fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1) as i32;
    let secs = config.initial_delay.as_secs_f64() * config.backoff_multiplier.powi(exponent);
    let max = config.max_delay.as_secs_f64();
    // NaN falls through clamp, so map it to the cap explicitly
    let secs = if secs.is_nan() { max } else { secs.clamp(0.0, max) };
    let capped = Duration::from_secs_f64(secs);
    if config.jitter {
        add_jitter(capped)
    } else {
        capped
    }
}

/// Add random jitter to a delay to prevent thundering herd
///
/// Jitter is uniformly distributed between 0% and 100% of the delay.
/// This means the actual delay will be between `delay` and `2 * delay`.
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    let jittered_secs = delay.as_secs_f64() * (1.0 + jitter_factor);
    Duration::from_secs_f64(jittered_secs)
}
