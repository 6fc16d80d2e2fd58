//! Three-state circuit breaker: Closed → Open → Half-Open.
//!
//! State transitions:
//! - `Closed` → `Open`:      after any completed call, `requests >= min_requests`
//!                           and `failures / requests >= failure_ratio`
//! - `Open` → `Half-Open`:   `open_timeout` has elapsed (checked on the next call)
//! - `Half-Open` → `Closed`: `max_probe_requests` consecutive probe successes
//! - `Half-Open` → `Open`:   any probe failure
//!
//! Counts live in a generation. A new generation starts on every state change
//! and, while closed, every `closed_interval`. Results reported against an
//! older generation are discarded.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::context::CallContext;
use crate::interceptor::{Interceptor, Next};
use crate::request::{Request, Response};
use crate::status::{Status, StatusSet};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// A limited number of probe calls test the dependency.
    HalfOpen,
    /// All calls rejected until `open_timeout` elapses.
    Open,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::HalfOpen => write!(f, "half-open"),
            Self::Open => write!(f, "open"),
        }
    }
}

/// Call statistics for the current generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    pub requests: u32,
    pub total_successes: u32,
    pub total_failures: u32,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

impl Counts {
    fn on_request(&mut self) {
        self.requests = self.requests.saturating_add(1);
    }

    fn on_success(&mut self) {
        self.total_successes = self.total_successes.saturating_add(1);
        self.consecutive_successes = self.consecutive_successes.saturating_add(1);
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.total_failures = self.total_failures.saturating_add(1);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_successes = 0;
    }

    /// An admitted call that never reported back.
    fn on_abandon(&mut self) {
        self.requests = self.requests.saturating_sub(1);
    }

    fn clear(&mut self) {
        *self = Self::default();
    }

    /// Fraction of requests in this generation that failed.
    pub fn failure_ratio(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            f64::from(self.total_failures) / f64::from(self.requests)
        }
    }
}

/// Configuration for one circuit breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Identifies the guarded dependency in logs.
    pub name: String,
    /// Probe calls allowed while half-open, and consecutive probe successes
    /// needed to close. `0` is treated as `1`.
    pub max_probe_requests: u32,
    /// How often closed-state counts reset. Zero disables the reset.
    #[serde(with = "humantime_serde")]
    pub closed_interval: Duration,
    /// How long to stay open before probing. Zero falls back to 60s.
    #[serde(with = "humantime_serde")]
    pub open_timeout: Duration,
    /// Requests needed in a generation before the ratio is considered.
    pub min_requests: u32,
    /// Failure ratio at or above which the circuit opens.
    pub failure_ratio: f64,
    /// Status codes that count as dependency failures.
    pub failure_codes: StatusSet,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: "grpc_circuit_breaker".into(),
            max_probe_requests: 10,
            closed_interval: Duration::from_secs(60),
            open_timeout: Duration::from_secs(5 * 60),
            min_requests: 40,
            failure_ratio: 0.6,
            failure_codes: StatusSet::server_errors(),
        }
    }
}

const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(60);

/// Why a call was rejected without being attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Open,
    TooManyRequests,
}

impl From<Rejection> for Status {
    fn from(rejection: Rejection) -> Self {
        match rejection {
            Rejection::Open => Status::unavailable("circuit breaker is open"),
            Rejection::TooManyRequests => {
                Status::resource_exhausted("circuit breaker: too many requests")
            }
        }
    }
}

struct CircuitInner {
    state: CircuitState,
    generation: u64,
    counts: Counts,
    /// End of the current closed interval or open timeout; `None` when the
    /// state never expires on its own.
    expiry: Option<Instant>,
    state_entered_at: Instant,
}

/// Thread-safe circuit breaker guarding one downstream dependency.
#[derive(Clone)]
pub struct CircuitBreaker {
    config: Arc<CircuitBreakerConfig>,
    inner: Arc<Mutex<CircuitInner>>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker in `Closed` state.
    pub fn new(mut config: CircuitBreakerConfig) -> Self {
        if config.max_probe_requests == 0 {
            config.max_probe_requests = 1;
        }
        if config.open_timeout.is_zero() {
            config.open_timeout = DEFAULT_OPEN_TIMEOUT;
        }

        let now = Instant::now();
        let breaker = Self {
            inner: Arc::new(Mutex::new(CircuitInner {
                state: CircuitState::Closed,
                generation: 0,
                counts: Counts::default(),
                expiry: None,
                state_entered_at: now,
            })),
            config: Arc::new(config),
        };
        {
            let mut inner = breaker.inner.lock();
            breaker.new_generation(&mut inner, now);
        }
        breaker
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state, applying any pending time-based transition.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.current_state(&mut inner, Instant::now())
    }

    /// Counts of the current generation.
    pub fn counts(&self) -> Counts {
        let mut inner = self.inner.lock();
        self.current_state(&mut inner, Instant::now());
        inner.counts
    }

    /// When the breaker entered its current state.
    pub fn state_entered_at(&self) -> Instant {
        self.inner.lock().state_entered_at
    }

    /// Run `f` if the breaker admits the call.
    ///
    /// Returns the synthesized rejection when short-circuiting; otherwise
    /// returns exactly what `f` produced after recording the outcome. Errors
    /// whose code is not in `failure_codes` are recorded as successes.
    pub async fn execute<T, F, Fut>(&self, f: F) -> Result<T, Status>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Status>>,
    {
        self.try_execute(f).await.map_err(Status::from)?
    }

    /// Like [`execute`](Self::execute), but keeps a rejection apart from the
    /// result of `f`.
    ///
    /// A panic inside `f` is recorded as a failure and then resumed.
    pub async fn try_execute<T, F, Fut>(&self, f: F) -> Result<Result<T, Status>, Rejection>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Status>>,
    {
        let generation = self.before_call()?;
        let mut permit = Permit {
            breaker: self,
            generation,
            armed: true,
        };

        let outcome = AssertUnwindSafe(f()).catch_unwind().await;
        permit.armed = false;

        match outcome {
            Ok(result) => {
                let success = match &result {
                    Ok(_) => true,
                    Err(status) => !self.is_failure(status),
                };
                self.after_call(generation, success);
                Ok(result)
            }
            Err(panic) => {
                self.after_call(generation, false);
                std::panic::resume_unwind(panic)
            }
        }
    }

    /// `true` if `status` counts against the dependency's health.
    pub fn is_failure(&self, status: &Status) -> bool {
        self.config.failure_codes.contains(status.code())
    }

    /// Admit or reject a call, returning the generation it belongs to.
    pub fn before_call(&self) -> Result<u64, Rejection> {
        let mut inner = self.inner.lock();
        let state = self.current_state(&mut inner, Instant::now());

        match state {
            CircuitState::Open => return Err(Rejection::Open),
            CircuitState::HalfOpen if inner.counts.requests >= self.config.max_probe_requests => {
                return Err(Rejection::TooManyRequests);
            }
            _ => {}
        }

        inner.counts.on_request();
        Ok(inner.generation)
    }

    /// Record the outcome of a call admitted in `generation`.
    pub fn after_call(&self, generation: u64, success: bool) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        self.current_state(&mut inner, now);
        if inner.generation != generation {
            return;
        }

        if success {
            self.on_success(&mut inner, now);
        } else {
            self.on_failure(&mut inner, now);
        }
    }

    fn abandon_call(&self, generation: u64) {
        let mut inner = self.inner.lock();
        self.current_state(&mut inner, Instant::now());
        if inner.generation == generation {
            inner.counts.on_abandon();
        }
    }

    fn on_success(&self, inner: &mut CircuitInner, now: Instant) {
        match inner.state {
            CircuitState::Closed => {
                inner.counts.on_success();
                self.trip_if_ready(inner, now);
            }
            CircuitState::HalfOpen => {
                inner.counts.on_success();
                if inner.counts.consecutive_successes >= self.config.max_probe_requests {
                    self.set_state(inner, CircuitState::Closed, now);
                }
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self, inner: &mut CircuitInner, now: Instant) {
        match inner.state {
            CircuitState::Closed => {
                inner.counts.on_failure();
                self.trip_if_ready(inner, now);
            }
            CircuitState::HalfOpen => self.set_state(inner, CircuitState::Open, now),
            CircuitState::Open => {}
        }
    }

    /// Checked after every completed call while closed, so a generation whose
    /// failures came first still trips once enough requests have been seen.
    fn trip_if_ready(&self, inner: &mut CircuitInner, now: Instant) {
        let counts = inner.counts;
        let ready = counts.total_failures > 0
            && counts.requests >= self.config.min_requests
            && counts.failure_ratio() >= self.config.failure_ratio;
        if ready {
            tracing::warn!(
                breaker = %self.config.name,
                requests = counts.requests,
                failures = counts.total_failures,
                "failure ratio reached"
            );
            self.set_state(inner, CircuitState::Open, now);
        }
    }

    /// Apply time-based transitions and return the resulting state.
    fn current_state(&self, inner: &mut CircuitInner, now: Instant) -> CircuitState {
        match inner.state {
            CircuitState::Closed => {
                if inner.expiry.is_some_and(|expiry| expiry <= now) {
                    self.new_generation(inner, now);
                }
            }
            CircuitState::Open => {
                if inner.expiry.is_some_and(|expiry| expiry <= now) {
                    self.set_state(inner, CircuitState::HalfOpen, now);
                }
            }
            CircuitState::HalfOpen => {}
        }
        inner.state
    }

    fn set_state(&self, inner: &mut CircuitInner, to: CircuitState, now: Instant) {
        let from = inner.state;
        if from == to {
            return;
        }

        inner.state = to;
        inner.state_entered_at = now;
        self.new_generation(inner, now);

        tracing::info!(
            breaker = %self.config.name,
            %from,
            %to,
            "circuit breaker state changed"
        );
    }

    fn new_generation(&self, inner: &mut CircuitInner, now: Instant) {
        inner.generation = inner.generation.wrapping_add(1);
        inner.counts.clear();
        inner.expiry = match inner.state {
            CircuitState::Closed if self.config.closed_interval.is_zero() => None,
            CircuitState::Closed => Some(now + self.config.closed_interval),
            CircuitState::Open => Some(now + self.config.open_timeout),
            CircuitState::HalfOpen => None,
        };
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.config.name)
            .field("state", &self.state())
            .finish()
    }
}

/// Releases the request slot of an admitted call whose future is dropped
/// before it reports an outcome.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    armed: bool,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.abandon_call(self.generation);
        }
    }
}

/// Client interceptor routing every call through one [`CircuitBreaker`].
pub struct CircuitBreakerInterceptor {
    breaker: CircuitBreaker,
}

impl CircuitBreakerInterceptor {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::from_breaker(CircuitBreaker::new(config))
    }

    /// Share an existing breaker, e.g. across several chains to the same
    /// dependency.
    pub fn from_breaker(breaker: CircuitBreaker) -> Self {
        Self { breaker }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }
}

#[async_trait]
impl Interceptor for CircuitBreakerInterceptor {
    async fn intercept(
        &self,
        ctx: &CallContext,
        req: Request,
        next: Next<'_>,
    ) -> Result<Response, Status> {
        let method = req.method.clone();
        match self.breaker.try_execute(|| next.run(ctx, req)).await {
            Ok(Err(status)) if self.breaker.is_failure(&status) => {
                tracing::warn!(%method, breaker = %self.breaker.name(), error = %status, "server error from dependency");
                Err(status)
            }
            Ok(result) => result,
            Err(rejection) => {
                match rejection {
                    Rejection::Open => {
                        tracing::warn!(%method, breaker = %self.breaker.name(), "circuit open, failing fast")
                    }
                    Rejection::TooManyRequests => {
                        tracing::warn!(%method, breaker = %self.breaker.name(), "too many requests in half-open state")
                    }
                }
                Err(rejection.into())
            }
        }
    }
}
