//! The interceptor capability and the explicit chain that threads a call
//! through it.
//!
//! ```text
//! Chain::call → [Interceptor 0] → [Interceptor 1] → ... → [Endpoint]
//! ```
//!
//! Each interceptor receives a [`Next`] continuation for the rest of the chain.
//! `Next` is `Copy`, so an interceptor may run it zero times (short-circuit),
//! once, or several times (retry).

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::context::CallContext;
use crate::request::{Request, Response};
use crate::status::Status;

/// The innermost call: a client transport invoke or a server business handler.
#[async_trait]
pub trait Endpoint: Send + Sync + 'static {
    async fn call(&self, ctx: &CallContext, req: Request) -> Result<Response, Status>;
}

/// A middleware unit wrapping a call.
///
/// # Thread Safety
/// Implementations must be `Send + Sync`; one instance serves every concurrent
/// call passing through its chain.
#[async_trait]
pub trait Interceptor: Send + Sync + 'static {
    async fn intercept(
        &self,
        ctx: &CallContext,
        req: Request,
        next: Next<'_>,
    ) -> Result<Response, Status>;
}

/// Continuation over the remaining interceptors and the endpoint.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    rest: &'a [Arc<dyn Interceptor>],
    endpoint: &'a dyn Endpoint,
}

impl<'a> Next<'a> {
    pub fn new(rest: &'a [Arc<dyn Interceptor>], endpoint: &'a dyn Endpoint) -> Self {
        Self { rest, endpoint }
    }

    /// Run the rest of the chain.
    pub async fn run(self, ctx: &CallContext, req: Request) -> Result<Response, Status> {
        match self.rest.split_first() {
            Some((head, rest)) => {
                head.intercept(ctx, req, Next::new(rest, self.endpoint))
                    .await
            }
            None => self.endpoint.call(ctx, req).await,
        }
    }
}

/// An ordered (outer→inner) list of interceptors around an endpoint.
#[derive(Clone)]
pub struct Chain {
    interceptors: Vec<Arc<dyn Interceptor>>,
    endpoint: Arc<dyn Endpoint>,
}

impl Chain {
    pub fn builder(endpoint: impl Endpoint) -> ChainBuilder {
        ChainBuilder::new(Arc::new(endpoint))
    }

    /// Execute a call through every interceptor and the endpoint.
    pub async fn call(&self, ctx: &CallContext, req: Request) -> Result<Response, Status> {
        Next::new(&self.interceptors, self.endpoint.as_ref())
            .run(ctx, req)
            .await
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }
}

impl fmt::Debug for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chain")
            .field("interceptors", &self.interceptors.len())
            .finish()
    }
}

/// Builds a [`Chain`]; each `layer` call nests inside the previous ones.
pub struct ChainBuilder {
    interceptors: Vec<Arc<dyn Interceptor>>,
    endpoint: Arc<dyn Endpoint>,
}

impl ChainBuilder {
    pub fn new(endpoint: Arc<dyn Endpoint>) -> Self {
        Self {
            interceptors: Vec::new(),
            endpoint,
        }
    }

    pub fn layer(mut self, interceptor: impl Interceptor) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    pub fn layer_arc(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn build(self) -> Chain {
        Chain {
            interceptors: self.interceptors,
            endpoint: self.endpoint,
        }
    }
}

/// An [`Endpoint`] backed by an async closure.
pub struct FnEndpoint<F>(F);

/// Wrap a closure `Fn(CallContext, Request) -> impl Future<Output = Result<Response, Status>>`
/// as an [`Endpoint`].
pub fn endpoint_fn<F, Fut>(f: F) -> FnEndpoint<F>
where
    F: Fn(CallContext, Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response, Status>> + Send + 'static,
{
    FnEndpoint(f)
}

#[async_trait]
impl<F, Fut> Endpoint for FnEndpoint<F>
where
    F: Fn(CallContext, Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response, Status>> + Send + 'static,
{
    async fn call(&self, ctx: &CallContext, req: Request) -> Result<Response, Status> {
        (self.0)(ctx.clone(), req).await
    }
}
