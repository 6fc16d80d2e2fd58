//! callguard-stack — ready-made client and server interceptor stacks.
//!
//! ```text
//! client: [RateLimiter] → [CircuitBreaker] → [Retry] → transport
//! server: [RecoveryGuard] → (tracing, metrics) → [RateLimiter] → (validation) → (error mapping) → handler
//! ```
//!
//! Stacks are built explicitly from a transport or handler; nothing registers
//! itself globally.

pub mod client;
pub mod config;
pub mod observability;
pub mod server;

pub use client::{ClientStack, ClientStackBuilder};
pub use config::{ClientConfig, ConfigError, MiddlewareConfig, ServerConfig};
pub use observability::{MetricsInterceptor, TracingInterceptor};
pub use server::{ServerStack, ServerStackBuilder};
