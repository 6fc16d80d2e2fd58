//! callguard-core — interceptor trait, status codes and resilience policies.
//!
//! # Overview
//!
//! CallGuard wraps inter-service calls on both sides. The core crate defines:
//!
//! - [`Interceptor`] / [`Endpoint`] / [`Chain`] — explicit "next" continuation chaining
//! - [`Request`] / [`Response`] — opaque call envelopes
//! - [`Status`] / [`Code`] — the error type every stage returns
//! - [`CallContext`] — cancellation, deadline and the idempotency marker
//! - [`policy`] module — rate limiter, circuit breaker, retry, panic recovery

pub mod context;
pub mod interceptor;
pub mod policy;
pub mod request;
pub mod status;

pub use context::{CallContext, IDEMPOTENCY_KEY};
pub use interceptor::{endpoint_fn, Chain, ChainBuilder, Endpoint, FnEndpoint, Interceptor, Next};
pub use request::{Request, Response};
pub use status::{Code, ParseCodeError, Status, StatusSet};
