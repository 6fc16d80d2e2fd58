//! Policy engine — composable interceptors for call reliability.
//!
//! Client stack (outer → inner):
//! ```text
//! Request → [RateLimiter] → [CircuitBreaker] → [RetryPolicy] → [Transport]
//! ```
//!
//! Server stack (outer → inner):
//! ```text
//! Request → [RecoveryGuard] → (observability) → [RateLimiter] → (validation) → (error mapping) → [Handler]
//! ```

pub mod circuit_breaker;
pub mod rate_limiter;
pub mod recovery;
pub mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerInterceptor, CircuitState, Counts,
    Rejection,
};
pub use rate_limiter::{
    ClientRateLimiter, LimiterConfig, LimiterRegistry, ServerRateLimiter, TokenBucket,
    TokenBucketConfig,
};
pub use recovery::RecoveryGuard;
pub use retry::{RetryConfig, RetryInterceptor, RetryPolicy};
