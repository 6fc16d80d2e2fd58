//! Fixed-delay retry, gated on the call's idempotency marker.
//!
//! A call is repeated only when it carries an idempotency token and its error
//! code is retryable. Without the token exactly one attempt is made, so a
//! non-idempotent side effect is never duplicated by this layer.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::context::CallContext;
use crate::interceptor::{Interceptor, Next};
use crate::request::{Request, Response};
use crate::status::{Status, StatusSet};

/// Configuration for the retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not counting the first try).
    pub max_retries: u32,
    /// Fixed pause between attempts.
    #[serde(with = "humantime_serde")]
    pub delay: Duration,
    /// Status codes that make an idempotent call worth repeating.
    pub retryable_codes: StatusSet,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay: Duration::from_millis(100),
            retryable_codes: StatusSet::transient(),
        }
    }
}

/// Stateless retry policy; share freely across tasks.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Returns `true` if `status` may be retried.
    pub fn is_retryable(&self, status: &Status) -> bool {
        self.config.retryable_codes.contains(status.code())
    }

    /// Run `f` up to `1 + max_retries` times.
    ///
    /// Returns on the first success, on the first non-retryable error, or with
    /// the last error once retries are exhausted. The pause between attempts
    /// ends early with the context's error if the context ends.
    pub async fn execute<T, F, Fut>(
        &self,
        ctx: &CallContext,
        method: &str,
        mut f: F,
    ) -> Result<T, Status>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Status>>,
    {
        if !ctx.is_idempotent() {
            return f().await;
        }

        let mut attempt = 0u32;
        loop {
            if attempt > 0 {
                tracing::info!(attempt, method, "retry attempt");
            }

            let err = match f().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !self.is_retryable(&err) {
                return Err(err);
            }
            if attempt >= self.config.max_retries {
                tracing::warn!(attempts = attempt + 1, method, error = %err, "max retries exceeded");
                return Err(err);
            }

            tokio::select! {
                status = ctx.done() => return Err(status),
                _ = tokio::time::sleep(self.config.delay) => {}
            }
            attempt += 1;
        }
    }
}

/// Client interceptor that re-runs the inner chain per [`RetryPolicy`].
pub struct RetryInterceptor {
    policy: RetryPolicy,
}

impl RetryInterceptor {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            policy: RetryPolicy::new(config),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

#[async_trait]
impl Interceptor for RetryInterceptor {
    async fn intercept(
        &self,
        ctx: &CallContext,
        req: Request,
        next: Next<'_>,
    ) -> Result<Response, Status> {
        let method = req.method.clone();
        self.policy
            .execute(ctx, &method, || next.run(ctx, req.clone()))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    use crate::status::Code;

    fn policy(max_retries: u32, delay_ms: u64) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_retries,
            delay: Duration::from_millis(delay_ms),
            ..RetryConfig::default()
        })
    }

    fn idempotent() -> CallContext {
        CallContext::new().with_idempotency_token("key-1")
    }

    #[tokio::test]
    async fn without_marker_attempts_once() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let err = policy(3, 1)
            .execute(&CallContext::new(), "/m", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Status::unavailable("down"))
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Unavailable);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn with_marker_retries_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let start = Instant::now();
        let value = policy(3, 10)
            .execute(&idempotent(), "/m", || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Status::unavailable("down"))
                } else {
                    Ok("done")
                }
            })
            .await
            .unwrap();
        assert_eq!(value, "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn non_retryable_error_returns_immediately() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let err = policy(3, 1)
            .execute(&idempotent(), "/m", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Status::invalid_argument("bad input"))
            })
            .await
            .unwrap_err();
        assert_eq!(err, Status::invalid_argument("bad input"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_return_last_error() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let start = Instant::now();
        let err = policy(2, 10)
            .execute(&idempotent(), "/m", || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Status::unavailable(format!("attempt {n}")))
            })
            .await
            .unwrap_err();
        assert_eq!(err.message(), "attempt 2");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // No pause after the final attempt.
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert!(start.elapsed() < Duration::from_millis(30));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_delay() {
        let ctx = idempotent();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            canceller.cancel();
        });

        let counter = AtomicU32::new(0);
        let calls = &counter;
        let start = Instant::now();
        let err = policy(3, 1_000)
            .execute(&ctx, "/m", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Status::unavailable("down"))
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_interrupts_delay() {
        let ctx = CallContext::new()
            .with_idempotency_token("key-2")
            .with_timeout(Duration::from_millis(150));

        let counter = AtomicU32::new(0);
        let calls = &counter;
        let start = Instant::now();
        let err = policy(3, 100)
            .execute(&ctx, "/m", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Status::unavailable("down"))
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::DeadlineExceeded);
        // Attempts at 0ms and 100ms; the second pause is cut short at 150ms.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(start.elapsed() >= Duration::from_millis(150));
        assert!(start.elapsed() < Duration::from_millis(200));
    }

    #[test]
    fn default_retryable_codes() {
        let p = RetryPolicy::new(RetryConfig::default());
        assert!(p.is_retryable(&Status::unavailable("x")));
        assert!(p.is_retryable(&Status::internal("x")));
        assert!(!p.is_retryable(&Status::invalid_argument("x")));
        assert!(!p.is_retryable(&Status::new(Code::NotFound, "x")));
    }
}
