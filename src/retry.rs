//! Retry, backoff, and timeout policy shared by every external provider.
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → [`ProviderError::Transient`]
//! - HTTP 4xx (client error, not 429) → [`ProviderError::Permanent`]
//! - Network errors and timeouts → transient
//! - Backoff: `base`, `2 × base`, `4 × base`, … (capped at `32 × base`)
//!
//! Only transient failures are retried. The last error is returned once
//! the attempts run out.

use std::future::Future;
use std::time::Duration;

use chat_recall_core::error::ProviderError;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub backoff_base: Duration,
    /// Deadline for a single attempt.
    pub timeout: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff_base_ms: u64, timeout_secs: u64) -> Self {
        Self {
            max_retries,
            backoff_base: Duration::from_millis(backoff_base_ms),
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_base * (1u32 << (attempt.saturating_sub(1)).min(5))
    }
}

/// Run `op` under `policy`, retrying transient failures.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut op: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let mut last_err = None;

    for attempt in 0..=policy.max_retries {
        if attempt > 0 {
            let delay = policy.backoff(attempt);
            debug!(provider = label, attempt, delay_ms = delay.as_millis() as u64, "retrying");
            tokio::time::sleep(delay).await;
        }

        let outcome = match tokio::time::timeout(policy.timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Transient(format!(
                "{} timed out after {}s",
                label,
                policy.timeout.as_secs()
            ))),
        };

        match outcome {
            Ok(value) => return Ok(value),
            Err(e @ ProviderError::Permanent(_)) => return Err(e),
            Err(e) => {
                warn!(provider = label, attempt, error = %e, "transient provider failure");
                last_err = Some(e);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| ProviderError::Transient(format!("{} failed after retries", label))))
}

/// Map a non-success HTTP status to a provider error.
pub fn classify_status(label: &str, status: reqwest::StatusCode, body: &str) -> ProviderError {
    let message = format!("{} API error {}: {}", label, status, body.trim());
    if status.as_u16() == 429 || status.is_server_error() {
        ProviderError::Transient(message)
    } else {
        ProviderError::Permanent(message)
    }
}

/// Network-level failures (connect, reset, timeout) are worth retrying.
pub fn classify_reqwest(label: &str, err: reqwest::Error) -> ProviderError {
    if err.is_decode() || err.is_builder() {
        ProviderError::Permanent(format!("{}: {}", label, err))
    } else {
        ProviderError::Transient(format!("{} connection error: {}", label, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryPolicy {
        RetryPolicy::new(3, 1, 5)
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let p = RetryPolicy::new(10, 100, 1);
        assert_eq!(p.backoff(1), Duration::from_millis(100));
        assert_eq!(p.backoff(2), Duration::from_millis(200));
        assert_eq!(p.backoff(4), Duration::from_millis(800));
        assert_eq!(p.backoff(9), Duration::from_millis(3200));
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let calls = AtomicU32::new(0);
        let out = with_retry(&fast(), "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ProviderError::Transient("429".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(out, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_stops_immediately() {
        let calls = AtomicU32::new(0);
        let out: Result<(), _> = with_retry(&fast(), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ProviderError::Permanent("401".into())) }
        })
        .await;
        assert!(matches!(out, Err(ProviderError::Permanent(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_return_last_error() {
        let calls = AtomicU32::new(0);
        let out: Result<(), _> = with_retry(&fast(), "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { Err(ProviderError::Transient(format!("attempt {}", n))) }
        })
        .await;
        assert_eq!(out, Err(ProviderError::Transient("attempt 3".into())));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_zero_retries_tries_once() {
        let calls = AtomicU32::new(0);
        let out: Result<(), _> = with_retry(&RetryPolicy::new(0, 1, 5), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(ProviderError::Transient("timeout".into())) }
        })
        .await;
        assert!(out.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_classify_status() {
        assert!(classify_status("x", reqwest::StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(classify_status("x", reqwest::StatusCode::BAD_GATEWAY, "").is_transient());
        assert!(!classify_status("x", reqwest::StatusCode::UNAUTHORIZED, "").is_transient());
    }
}
