//! Retry with exponential backoff for remote calls.
//!
//! Every collaborator call (item source pages, note CRUD, LLM analyze) goes
//! through [`retry_with_backoff`], which retries only failures matching the
//! transient allow-list: timeouts, connection drops, rate limits (429), and
//! 500/502/503/504 server errors. Authentication, permission, not-found, and
//! validation failures propagate immediately; retrying a permanent error
//! only delays the real diagnosis.

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use tracing::warn;

use crate::config::RetryConfig;

/// Transient signatures worth retrying. An allow-list, deliberately: any
/// message that matches nothing here is treated as permanent.
const TRANSIENT_SIGNATURES: &[&str] = &[
    "timeout",
    "timed out",
    "connection",
    "connect error",
    "rate limit",
    "too many requests",
    "429",
    "500",
    "502",
    "503",
    "504",
    "server error",
    "service unavailable",
    "temporarily",
];

/// Whether an error message matches the transient allow-list.
pub fn is_transient_error(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    TRANSIENT_SIGNATURES.iter().any(|sig| lower.contains(sig))
}

/// Run `operation`, retrying transient failures with exponential backoff.
///
/// The delay doubles each attempt, capped at `max_delay`. Non-transient
/// errors and the final exhausted error are returned unchanged so callers
/// keep the original context chain.
pub async fn retry_with_backoff<T, F, Fut>(
    mut operation: F,
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
    description: &str,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = base_delay;

    for attempt in 0..=max_retries {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let message = format!("{:#}", err);
                if !is_transient_error(&message) {
                    return Err(err);
                }
                if attempt == max_retries {
                    return Err(err);
                }
                warn!(
                    "{} failed (attempt {}/{}), retrying in {:?}: {}",
                    description,
                    attempt + 1,
                    max_retries + 1,
                    delay,
                    message
                );
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(max_delay);
            }
        }
    }

    unreachable!("retry loop returns on success or final error")
}

/// Convenience wrapper reading the retry budget from config.
pub async fn retry_with_policy<T, F, Fut>(
    config: &RetryConfig,
    description: &str,
    operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_with_backoff(
        operation,
        config.max_retries,
        Duration::from_millis(config.base_delay_ms),
        Duration::from_millis(config.max_delay_ms),
        description,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_classifier_table() {
        let transient = [
            "request timeout",
            "operation timed out after 30s",
            "connection reset by peer",
            "HTTP 429 Too Many Requests",
            "API error 500: internal",
            "API error 502: bad gateway",
            "API error 503: overloaded",
            "API error 504: gateway timeout",
            "rate limit exceeded",
        ];
        let permanent = [
            "authentication failed",
            "invalid api key",
            "permission denied",
            "HTTP 401 Unauthorized",
            "HTTP 403 Forbidden",
            "HTTP 404 Not Found",
            "collection does not exist",
            "validation error: missing target collection",
        ];

        for msg in transient {
            assert!(is_transient_error(msg), "should retry: {}", msg);
        }
        for msg in permanent {
            assert!(!is_transient_error(msg), "should not retry: {}", msg);
        }
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32> = retry_with_backoff(
            || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    anyhow::bail!("connection refused")
                }
                Ok(n)
            },
            5,
            Duration::from_millis(1),
            Duration::from_millis(2),
            "test op",
        )
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_fails_fast() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_with_backoff(
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("403 Forbidden")
            },
            5,
            Duration::from_millis(1),
            Duration::from_millis(2),
            "test op",
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_return_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_with_backoff(
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("HTTP 503 Service Unavailable")
            },
            2,
            Duration::from_millis(1),
            Duration::from_millis(2),
            "test op",
        )
        .await;
        let err = result.unwrap_err();
        assert!(err.to_string().contains("503"));
        // initial attempt + 2 retries
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
