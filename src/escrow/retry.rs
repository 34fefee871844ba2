//! Retry and error recovery for chain calls
//!
//! Every RPC interaction with the escrow contract goes through
//! [`with_retry`]: exponential backoff from a 1 s base, doubling per
//! attempt, at most 5 attempts. Permanent failures (reverts, bad
//! parameters) skip the remaining attempts.

use eyre::{eyre, Result};
use std::time::Duration;
use tracing::{debug, warn};

/// Chain-call retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (first try included)
    pub max_attempts: u32,
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Backoff multiplier for exponential growth
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Calculate backoff duration for a given attempt (0-indexed)
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let backoff_secs =
            self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(attempt as i32);
        let capped = backoff_secs.min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped)
    }

    /// Check if another attempt is allowed
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt + 1 < self.max_attempts
    }
}

/// Classifies errors for retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Temporary failure - should retry (RPC timeout, network issues)
    Transient,
    /// Permanent failure - do not retry (revert, invalid params)
    Permanent,
    /// Unknown error - retry with backoff
    Unknown,
}

/// Classify an error message for retry decisions
pub fn classify_error(error: &str) -> ErrorClass {
    let error_lower = error.to_lowercase();

    if error_lower.contains("timeout")
        || error_lower.contains("connection")
        || error_lower.contains("network")
        || error_lower.contains("rate limit")
        || error_lower.contains("too many requests")
        || error_lower.contains("503")
        || error_lower.contains("502")
        || error_lower.contains("temporarily unavailable")
    {
        return ErrorClass::Transient;
    }

    if error_lower.contains("reverted")
        || error_lower.contains("execution reverted")
        || error_lower.contains("invalid signature")
        || error_lower.contains("insufficient funds")
        || error_lower.contains("out of gas")
        || error_lower.contains("invalid parameters")
    {
        return ErrorClass::Permanent;
    }

    ErrorClass::Unknown
}

/// Execute a chain call with retry logic
pub async fn with_retry<F, T, Fut>(config: &RetryConfig, mut operation: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0u32;

    loop {
        match operation(attempt).await {
            Ok(result) => return Ok(result),
            Err(e) => {
                let error_str = e.to_string();

                if classify_error(&error_str) == ErrorClass::Permanent {
                    warn!(error = %error_str, "Permanent chain error, not retrying");
                    return Err(eyre!("permanent failure: {}", error_str));
                }

                if !config.should_retry(attempt) {
                    warn!(
                        attempts = attempt + 1,
                        error = %error_str,
                        "Chain call failed after final attempt"
                    );
                    return Err(e);
                }

                let backoff = config.backoff_for_attempt(attempt);
                debug!(
                    attempt = attempt + 1,
                    max = config.max_attempts,
                    ?backoff,
                    error = %error_str,
                    "Retrying chain call after backoff"
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_schedule() {
        let config = RetryConfig::default();

        assert_eq!(config.backoff_for_attempt(0), Duration::from_secs(1));
        assert_eq!(config.backoff_for_attempt(1), Duration::from_secs(2));
        assert_eq!(config.backoff_for_attempt(2), Duration::from_secs(4));
        assert_eq!(config.backoff_for_attempt(3), Duration::from_secs(8));
        assert_eq!(config.backoff_for_attempt(7), Duration::from_secs(60)); // capped
    }

    #[test]
    fn test_attempt_budget() {
        let config = RetryConfig::default();
        assert!(config.should_retry(0));
        assert!(config.should_retry(3));
        assert!(!config.should_retry(4));
    }

    #[test]
    fn test_error_classification() {
        assert_eq!(classify_error("connection timeout"), ErrorClass::Transient);
        assert_eq!(classify_error("execution reverted"), ErrorClass::Permanent);
        assert_eq!(classify_error("some unknown error"), ErrorClass::Unknown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let config = RetryConfig::default();
        let calls = AtomicU32::new(0);

        let result = with_retry(&config, |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(eyre!("network unreachable"))
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_short_circuits() {
        let config = RetryConfig::default();
        let calls = AtomicU32::new(0);

        let result: Result<()> = with_retry(&config, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(eyre!("execution reverted: bad state")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let config = RetryConfig::default();
        let calls = AtomicU32::new(0);

        let result: Result<()> = with_retry(&config, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(eyre!("network flake")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), config.max_attempts);
    }
}
