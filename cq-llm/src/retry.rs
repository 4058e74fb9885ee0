use crate::error::Result;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Immutable retry configuration. Never mutated at runtime; every retry
/// computes a fresh delay from it.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub retryable_statuses: Vec<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            retryable_statuses: vec![429, 500, 502, 503, 504],
        }
    }
}

impl RetryPolicy {
    pub fn is_retryable(&self, status: u16) -> bool {
        self.retryable_statuses.contains(&status)
    }
}

/// One completed HTTP exchange: terminal status plus body, and the parsed
/// `Retry-After` hint when the server provided one.
#[derive(Debug, Clone)]
pub struct HttpOutcome {
    pub status: u16,
    pub body: String,
    pub retry_after: Option<Duration>,
}

/// Exponential backoff with jitter, capped at `max_delay` and floored by a
/// server-provided retry hint when present.
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32, retry_after: Option<Duration>) -> Duration {
    let jitter: f64 = rand::rng().random_range(0.0..0.3);
    let exp = 2f64.powi(attempt.min(16) as i32);
    let millis = policy.base_delay.as_millis() as f64 * exp * (1.0 + jitter);
    let mut delay = Duration::from_millis(millis as u64);
    if let Some(hint) = retry_after {
        delay = delay.max(hint);
    }
    delay.min(policy.max_delay)
}

/// Drive one request closure through the retry policy. Retryable statuses
/// are retried with backoff while attempts remain; exhaustion or a
/// non-retryable status returns the last outcome unmodified. Network-layer
/// errors propagate immediately without retry.
pub async fn send_with_retry<F, Fut>(policy: &RetryPolicy, mut attempt_fn: F) -> Result<HttpOutcome>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<HttpOutcome>>,
{
    let mut attempt = 0u32;
    loop {
        let outcome = attempt_fn().await?;
        if !policy.is_retryable(outcome.status) || attempt + 1 >= policy.max_attempts {
            if attempt > 0 {
                tracing::debug!(
                    attempts = attempt + 1,
                    final_status = outcome.status,
                    "retry transport finished"
                );
            }
            return Ok(outcome);
        }
        let delay = backoff_delay(policy, attempt, outcome.retry_after);
        tracing::info!(
            status = outcome.status,
            attempt = attempt + 1,
            max_attempts = policy.max_attempts,
            delay_ms = delay.as_millis() as u64,
            "retrying transient http failure"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(50),
            retryable_statuses: vec![429, 500, 502, 503, 504],
        }
    }

    #[test]
    fn backoff_is_monotone_and_capped() {
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            ..RetryPolicy::default()
        };
        let mut previous = Duration::ZERO;
        for attempt in 0..10 {
            let delay = backoff_delay(&policy, attempt, None);
            assert!(delay >= previous, "delay regressed at attempt {attempt}");
            assert!(delay <= policy.max_delay);
            previous = delay;
        }
    }

    #[test]
    fn backoff_honors_server_hint() {
        let policy = fast_policy();
        let delay = backoff_delay(&policy, 0, Some(Duration::from_millis(40)));
        assert!(delay >= Duration::from_millis(40));
        assert!(delay <= policy.max_delay);
    }

    #[tokio::test]
    async fn exhaustion_returns_last_outcome() {
        let policy = fast_policy();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();
        let outcome = send_with_retry(&policy, move || {
            let calls = calls_in.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(HttpOutcome {
                    status: 503,
                    body: "overloaded".to_string(),
                    retry_after: None,
                })
            }
        })
        .await
        .expect("outcome");
        assert_eq!(calls.load(Ordering::SeqCst), policy.max_attempts);
        assert_eq!(outcome.status, 503);
        assert_eq!(outcome.body, "overloaded");
    }

    #[tokio::test]
    async fn non_retryable_status_returns_immediately() {
        let policy = fast_policy();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();
        let outcome = send_with_retry(&policy, move || {
            let calls = calls_in.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(HttpOutcome {
                    status: 400,
                    body: "bad request".to_string(),
                    retry_after: None,
                })
            }
        })
        .await
        .expect("outcome");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.status, 400);
    }

    #[tokio::test]
    async fn retryable_then_success_stops_retrying() {
        let policy = fast_policy();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();
        let outcome = send_with_retry(&policy, move || {
            let calls = calls_in.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                let status = if n == 0 { 429 } else { 200 };
                Ok(HttpOutcome {
                    status,
                    body: String::new(),
                    retry_after: None,
                })
            }
        })
        .await
        .expect("outcome");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(outcome.status, 200);
    }

    #[tokio::test]
    async fn network_errors_are_not_retried() {
        let policy = fast_policy();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = calls.clone();
        let err = send_with_retry(&policy, move || {
            let calls = calls_in.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(LlmError::Network("connection refused".to_string()))
            }
        })
        .await
        .expect_err("network error should propagate");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, LlmError::Network(_)));
    }
}
