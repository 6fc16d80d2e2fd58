//! Token bucket rate limiting.
//!
//! Models a token bucket: tokens accrue at `limit` tokens/second up to
//! `burst`. Each call consumes one token. Refill is computed lazily from the
//! elapsed time on every access; there is no background timer.
//!
//! Two admission modes sit on top of the bucket:
//! - [`ClientRateLimiter`] waits for a token (bounded by the call context).
//! - [`ServerRateLimiter`] rejects immediately via a [`LimiterRegistry`] holding
//!   an optional global bucket plus one bucket per method.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::context::CallContext;
use crate::interceptor::{Interceptor, Next};
use crate::request::{Request, Response};
use crate::status::Status;

/// Token bucket configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TokenBucketConfig {
    /// Token refill rate (tokens per second).
    pub limit: f64,
    /// Maximum tokens in the bucket.
    pub burst: u32,
}

impl TokenBucketConfig {
    pub fn new(limit: f64, burst: u32) -> Self {
        Self { limit, burst }
    }
}

impl Default for TokenBucketConfig {
    fn default() -> Self {
        Self {
            limit: 10.0,
            burst: 5,
        }
    }
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Thread-safe token bucket.
pub struct TokenBucket {
    config: TokenBucketConfig,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a bucket that starts full.
    pub fn new(config: TokenBucketConfig) -> Self {
        Self {
            state: Mutex::new(BucketState {
                tokens: f64::from(config.burst),
                last_refill: Instant::now(),
            }),
            config,
        }
    }

    pub fn config(&self) -> TokenBucketConfig {
        self.config
    }

    /// Try to take one token without waiting.
    ///
    /// Returns `true` if a token was available and consumed.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state);

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Wait until a token is available and take it.
    ///
    /// Returns the context's error, without consuming a token, if the context
    /// is already done or ends while waiting.
    pub async fn acquire(&self, ctx: &CallContext) -> Result<(), Status> {
        if self.config.burst == 0 {
            return Err(Status::resource_exhausted(
                "rate limiter burst is zero, no token can ever be granted",
            ));
        }

        loop {
            if let Some(err) = ctx.err() {
                return Err(err);
            }

            let wait = {
                let mut state = self.state.lock();
                self.refill(&mut state);
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return Ok(());
                }
                self.deficit_wait(state.tokens)
            };

            match wait {
                Some(wait) => {
                    tokio::select! {
                        status = ctx.done() => return Err(status),
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                // Nothing refills the bucket; only the context can end the wait.
                None => return Err(ctx.done().await),
            }
        }
    }

    /// Returns the estimated wait before one token is available.
    pub fn wait_time(&self) -> Duration {
        let mut state = self.state.lock();
        self.refill(&mut state);
        if state.tokens >= 1.0 {
            Duration::ZERO
        } else {
            self.deficit_wait(state.tokens).unwrap_or(Duration::MAX)
        }
    }

    /// Returns currently available tokens.
    pub fn available(&self) -> f64 {
        let mut state = self.state.lock();
        self.refill(&mut state);
        state.tokens
    }

    /// `None` when no refill can be expected: a zero rate, or one so slow the
    /// wait does not fit in a `Duration`.
    fn deficit_wait(&self, tokens: f64) -> Option<Duration> {
        if self.config.limit <= 0.0 {
            return None;
        }
        Duration::try_from_secs_f64((1.0 - tokens) / self.config.limit).ok()
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        let new_tokens = elapsed * self.config.limit.max(0.0);
        state.tokens = (state.tokens + new_tokens).clamp(0.0, f64::from(self.config.burst));
        state.last_refill = now;
    }
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket")
            .field("config", &self.config)
            .field("available", &self.available())
            .finish()
    }
}

/// Server-side limiter configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    /// Refill rate for methods without an override.
    pub default_limit: f64,
    pub default_burst: u32,
    /// Refill rate of the global bucket; `0` for either the rate or the
    /// burst disables it.
    pub global_limit: f64,
    pub global_burst: u32,
    /// Per-method overrides keyed by full method name.
    pub method_overrides: HashMap<String, TokenBucketConfig>,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            default_limit: 10.0,
            default_burst: 5,
            global_limit: 10.0,
            global_burst: 5,
            method_overrides: HashMap::new(),
        }
    }
}

/// Global bucket plus one bucket per method name.
///
/// Exactly one bucket exists per method for the registry's lifetime; buckets
/// for methods without an override are created on first use.
pub struct LimiterRegistry {
    default: TokenBucketConfig,
    global: Option<TokenBucket>,
    methods: RwLock<HashMap<String, Arc<TokenBucket>>>,
}

impl LimiterRegistry {
    pub fn new(config: LimiterConfig) -> Self {
        let global = (config.global_limit > 0.0 && config.global_burst > 0)
            .then(|| TokenBucket::new(TokenBucketConfig::new(config.global_limit, config.global_burst)));
        let methods = config
            .method_overrides
            .into_iter()
            .map(|(method, bucket)| (method, Arc::new(TokenBucket::new(bucket))))
            .collect();

        Self {
            default: TokenBucketConfig::new(config.default_limit, config.default_burst),
            global,
            methods: RwLock::new(methods),
        }
    }

    /// Install a dedicated bucket for `method`, replacing any existing one.
    pub fn with_method_limit(self, method: impl Into<String>, config: TokenBucketConfig) -> Self {
        self.methods
            .write()
            .insert(method.into(), Arc::new(TokenBucket::new(config)));
        self
    }

    /// The bucket for `method`, creating a default-rate one if needed.
    pub fn bucket(&self, method: &str) -> Arc<TokenBucket> {
        if let Some(bucket) = self.methods.read().get(method) {
            return Arc::clone(bucket);
        }

        // Re-check under the write lock: another caller may have created it.
        let mut methods = self.methods.write();
        Arc::clone(
            methods
                .entry(method.to_string())
                .or_insert_with(|| Arc::new(TokenBucket::new(self.default))),
        )
    }

    /// Admit or reject one call to `method` without waiting.
    ///
    /// The global bucket is checked first; a global rejection does not touch
    /// the method bucket.
    pub fn check(&self, method: &str) -> Result<(), Status> {
        if let Some(global) = &self.global {
            if !global.try_acquire() {
                tracing::warn!(method, "global rate limit exceeded");
                return Err(Status::resource_exhausted("global rate limit exceeded"));
            }
        }

        if !self.bucket(method).try_acquire() {
            tracing::warn!(method, "method rate limit exceeded");
            return Err(Status::resource_exhausted("rate limit exceeded"));
        }

        Ok(())
    }

    /// Number of method buckets created so far.
    pub fn method_count(&self) -> usize {
        self.methods.read().len()
    }
}

impl std::fmt::Debug for LimiterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LimiterRegistry")
            .field("default", &self.default)
            .field("global", &self.global)
            .field("methods", &self.method_count())
            .finish()
    }
}

/// Client-side interceptor: waits for a token before forwarding the call.
pub struct ClientRateLimiter {
    bucket: TokenBucket,
}

impl ClientRateLimiter {
    pub fn new(config: TokenBucketConfig) -> Self {
        Self {
            bucket: TokenBucket::new(config),
        }
    }

    pub fn bucket(&self) -> &TokenBucket {
        &self.bucket
    }
}

#[async_trait]
impl Interceptor for ClientRateLimiter {
    async fn intercept(
        &self,
        ctx: &CallContext,
        req: Request,
        next: Next<'_>,
    ) -> Result<Response, Status> {
        if let Err(err) = self.bucket.acquire(ctx).await {
            tracing::warn!(method = %req.method, error = %err, "client rate limit wait abandoned");
            return Err(err);
        }
        next.run(ctx, req).await
    }
}

/// Server-side interceptor: rejects calls over the global or per-method rate.
pub struct ServerRateLimiter {
    registry: Arc<LimiterRegistry>,
}

impl ServerRateLimiter {
    pub fn new(config: LimiterConfig) -> Self {
        Self::from_registry(Arc::new(LimiterRegistry::new(config)))
    }

    pub fn from_registry(registry: Arc<LimiterRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<LimiterRegistry> {
        &self.registry
    }
}

#[async_trait]
impl Interceptor for ServerRateLimiter {
    async fn intercept(
        &self,
        ctx: &CallContext,
        req: Request,
        next: Next<'_>,
    ) -> Result<Response, Status> {
        self.registry.check(&req.method)?;
        next.run(ctx, req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::Code;

    fn bucket(limit: f64, burst: u32) -> TokenBucket {
        TokenBucket::new(TokenBucketConfig::new(limit, burst))
    }

    #[test]
    fn acquire_within_capacity() {
        let b = bucket(1.0, 10);
        for _ in 0..10 {
            assert!(b.try_acquire(), "should succeed within capacity");
        }
    }

    #[test]
    fn reject_when_empty() {
        let b = bucket(0.0001, 3);
        b.try_acquire();
        b.try_acquire();
        b.try_acquire();
        assert!(!b.try_acquire(), "should be rate limited");
    }

    #[test]
    fn wait_time_when_empty() {
        let b = bucket(10.0, 1);
        b.try_acquire();
        let wait = b.wait_time();
        // ~100ms (1 token / 10 tokens per sec)
        assert!(
            wait.as_millis() >= 50 && wait.as_millis() <= 200,
            "unexpected wait time: {wait:?}"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn grants_bounded_by_burst_plus_refill() {
        let b = bucket(5.0, 3);
        let mut granted = 0;
        // 2 simulated seconds in 10ms steps.
        for _ in 0..200 {
            while b.try_acquire() {
                granted += 1;
            }
            tokio::time::advance(Duration::from_millis(10)).await;
        }
        assert!(granted <= 3 + 10, "granted {granted}");
        assert!(granted >= 3 + 9, "granted {granted}");
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_waits_for_refill() {
        let b = bucket(10.0, 1);
        let ctx = CallContext::new();
        b.acquire(&ctx).await.unwrap();
        let start = Instant::now();
        b.acquire(&ctx).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(99));
    }

    #[tokio::test]
    async fn cancelled_context_consumes_nothing() {
        let b = bucket(1.0, 2);
        let ctx = CallContext::new();
        ctx.cancel();
        let err = b.acquire(&ctx).await.unwrap_err();
        assert_eq!(err.code(), Code::Cancelled);
        assert!(b.available() >= 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_ends_wait() {
        let b = bucket(0.0, 1);
        assert!(b.try_acquire());
        let ctx = CallContext::new().with_timeout(Duration::from_millis(20));
        let err = b.acquire(&ctx).await.unwrap_err();
        assert_eq!(err.code(), Code::DeadlineExceeded);
    }

    #[tokio::test(start_paused = true)]
    async fn negligible_rate_waits_on_context_only() {
        let b = bucket(1e-20, 1);
        assert!(b.try_acquire());
        assert_eq!(b.wait_time(), Duration::MAX);

        let ctx = CallContext::new().with_timeout(Duration::from_millis(50));
        let err = b.acquire(&ctx).await.unwrap_err();
        assert_eq!(err.code(), Code::DeadlineExceeded);
    }

    #[tokio::test]
    async fn zero_burst_never_grants() {
        let b = bucket(100.0, 0);
        let err = b.acquire(&CallContext::new()).await.unwrap_err();
        assert_eq!(err.code(), Code::ResourceExhausted);
        assert!(!b.try_acquire());
    }

    #[test]
    fn registry_checks_global_first() {
        let registry = LimiterRegistry::new(LimiterConfig {
            default_limit: 0.0001,
            default_burst: 5,
            global_limit: 0.0001,
            global_burst: 1,
            method_overrides: HashMap::new(),
        });
        assert!(registry.check("/a").is_ok());
        let err = registry.check("/a").unwrap_err();
        assert_eq!(err.message(), "global rate limit exceeded");
        // The method bucket was not charged by the rejected call.
        assert!(registry.bucket("/a").available() >= 4.0 - 1e-6);
    }

    #[test]
    fn zero_global_burst_disables_global_bucket() {
        let registry = LimiterRegistry::new(LimiterConfig {
            global_limit: 10.0,
            global_burst: 0,
            ..LimiterConfig::default()
        });
        assert!(registry.check("/a").is_ok());
        assert!(registry.check("/b").is_ok());
    }

    #[test]
    fn registry_uses_overrides_and_defaults() {
        let registry = LimiterRegistry::new(LimiterConfig {
            default_limit: 0.0001,
            default_burst: 2,
            global_limit: 0.0,
            global_burst: 0,
            method_overrides: HashMap::new(),
        })
        .with_method_limit("/strict", TokenBucketConfig::new(0.0001, 1));

        assert!(registry.check("/strict").is_ok());
        let err = registry.check("/strict").unwrap_err();
        assert_eq!(err.code(), Code::ResourceExhausted);
        assert_eq!(err.message(), "rate limit exceeded");

        assert!(registry.check("/lenient").is_ok());
        assert!(registry.check("/lenient").is_ok());
        assert!(registry.check("/lenient").is_err());
    }

    #[test]
    fn registry_creates_one_bucket_per_method_under_contention() {
        let registry = Arc::new(LimiterRegistry::new(LimiterConfig {
            global_limit: 0.0,
            ..LimiterConfig::default()
        }));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || registry.bucket("/same"))
            })
            .collect();
        let buckets: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(buckets.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(registry.method_count(), 1);
    }
}
