//! Retry with exponential backoff for idempotent network calls.
//!
//! Catalog reads, page fetches, collection provisioning and index
//! statements go through [`with_retry`]. Batch upserts do not: a failed
//! batch aborts the run.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not including the initial attempt).
    pub max_retries: u32,
    /// Initial delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (e.g., 2.0 doubles delay each retry).
    pub backoff_multiplier: f64,
    /// Whether to add up to 25% jitter to each delay.
    pub add_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }
}

impl RetryConfig {
    /// A config that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Backoff delay before retry number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let base = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            Duration::from_secs_f64(capped * (1.0 + 0.25 * jitter()))
        } else {
            Duration::from_secs_f64(capped)
        }
    }

    /// Delay before retrying after `error`.
    ///
    /// A rate limit hint from the server wins over the backoff schedule but
    /// is still capped at `max_delay`.
    fn delay_after(&self, error: &Error, attempt: u32) -> Duration {
        match error {
            Error::RateLimit(secs) => Duration::from_secs(*secs).min(self.max_delay),
            _ => self.delay_for_attempt(attempt),
        }
    }
}

/// Pseudo-random value in `[0, 1)` taken from the clock.
fn jitter() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    f64::from(nanos % 1000) / 1000.0
}

/// Whether retrying `error` can succeed.
///
/// Credentials, configuration, parse and key errors are permanent.
/// Connection errors are retried when their message looks transient.
pub fn is_retryable_error(error: &Error) -> bool {
    match error {
        Error::RateLimit(_) | Error::Io(_) => true,
        Error::Http(e) => e.is_timeout() || e.is_connect(),
        Error::SourceConnection(msg) | Error::DestinationConnection(msg) | Error::Extraction(msg) => {
            is_transient_message(msg)
        }
        Error::Multiple(errors) => errors.iter().all(is_retryable_error),
        Error::Config(_)
        | Error::Authentication(_)
        | Error::Write(_)
        | Error::KeyGeneration(_)
        | Error::Json(_)
        | Error::Yaml(_) => false,
    }
}

fn is_transient_message(msg: &str) -> bool {
    const PATTERNS: &[&str] = &[
        "429",
        "rate limit",
        "too many requests",
        "timeout",
        "timed out",
        "connection refused",
        "connection reset",
        "temporary",
        "500",
        "502",
        "503",
        "504",
        "internal server error",
        "bad gateway",
        "service unavailable",
    ];
    let msg = msg.to_lowercase();
    PATTERNS.iter().any(|p| msg.contains(p))
}

/// Runs `operation` until it succeeds, fails permanently or runs out of retries.
///
/// `operation_name` only appears in log lines.
pub async fn with_retry<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!("{}: succeeded after {} retries", operation_name, attempt);
                }
                return Ok(result);
            }
            Err(e) if attempt < config.max_retries && is_retryable_error(&e) => {
                attempt += 1;
                let delay = config.delay_after(&e, attempt);
                warn!(
                    "{}: {} (retry {}/{} in {:?})",
                    operation_name, e, attempt, config.max_retries, delay
                );
                sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
