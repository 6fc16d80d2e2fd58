//! Client-side stack: rate limiter → circuit breaker → retry → transport.
//!
//! Load is shed before a breaker slot is taken, the breaker fails fast before
//! retry budget is spent, and retry sits next to the transport so that each
//! logical call is one breaker outcome however many attempts it took.

use std::sync::Arc;

use callguard_core::policy::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerInterceptor, ClientRateLimiter,
    RetryConfig, RetryInterceptor, TokenBucketConfig,
};
use callguard_core::{CallContext, Chain, ChainBuilder, Endpoint, Request, Response, Status};

use crate::config::ClientConfig;

/// An outbound call path to one downstream dependency.
#[derive(Clone, Debug)]
pub struct ClientStack {
    chain: Chain,
    breaker: Option<CircuitBreaker>,
}

impl ClientStack {
    /// Start a stack around `transport`, the call that actually reaches the
    /// dependency.
    pub fn builder(transport: impl Endpoint) -> ClientStackBuilder {
        ClientStackBuilder::new(Arc::new(transport))
    }

    /// A stack with all three policies configured from `config`.
    pub fn from_config(transport: impl Endpoint, config: &ClientConfig) -> Self {
        Self::builder(transport)
            .rate_limiter(config.rate_limit)
            .circuit_breaker(config.circuit_breaker.clone())
            .retry(config.retry.clone())
            .build()
    }

    /// Issue a call through the stack.
    pub async fn call(&self, ctx: &CallContext, req: Request) -> Result<Response, Status> {
        self.chain.call(ctx, req).await
    }

    /// The breaker guarding this dependency, if one is installed.
    pub fn breaker(&self) -> Option<&CircuitBreaker> {
        self.breaker.as_ref()
    }

    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }
}

/// Collects the client policies; [`build`](Self::build) always nests them in
/// the canonical order, whatever order they were supplied in.
pub struct ClientStackBuilder {
    transport: Arc<dyn Endpoint>,
    rate_limiter: Option<ClientRateLimiter>,
    breaker: Option<CircuitBreaker>,
    retry: Option<RetryInterceptor>,
}

impl ClientStackBuilder {
    pub fn new(transport: Arc<dyn Endpoint>) -> Self {
        Self {
            transport,
            rate_limiter: None,
            breaker: None,
            retry: None,
        }
    }

    pub fn rate_limiter(mut self, config: TokenBucketConfig) -> Self {
        self.rate_limiter = Some(ClientRateLimiter::new(config));
        self
    }

    pub fn circuit_breaker(self, config: CircuitBreakerConfig) -> Self {
        self.shared_circuit_breaker(CircuitBreaker::new(config))
    }

    /// Use an existing breaker, e.g. one shared by several stacks that reach
    /// the same dependency.
    pub fn shared_circuit_breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn retry(mut self, config: RetryConfig) -> Self {
        self.retry = Some(RetryInterceptor::new(config));
        self
    }

    pub fn build(self) -> ClientStack {
        let mut chain = ChainBuilder::new(self.transport);
        if let Some(limiter) = self.rate_limiter {
            chain = chain.layer(limiter);
        }
        if let Some(breaker) = &self.breaker {
            chain = chain.layer(CircuitBreakerInterceptor::from_breaker(breaker.clone()));
        }
        if let Some(retry) = self.retry {
            chain = chain.layer(retry);
        }

        ClientStack {
            chain: chain.build(),
            breaker: self.breaker,
        }
    }
}
