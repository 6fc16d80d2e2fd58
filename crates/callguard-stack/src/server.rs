//! Server-side stack.
//!
//! ```text
//! [RecoveryGuard] → (observability) → [RateLimiter] → (validation) → (error mapping) → [Handler]
//! ```
//!
//! Error mapping sits innermost so the status observed by the outer stages is
//! the final mapped one. Observability, validation and error mapping are
//! supplied by the service as plain [`Interceptor`]s.

use std::sync::Arc;

use callguard_core::policy::{LimiterConfig, LimiterRegistry, RecoveryGuard, ServerRateLimiter};
use callguard_core::{
    CallContext, Chain, ChainBuilder, Endpoint, Interceptor, Request, Response, Status,
};

use crate::config::ServerConfig;
use crate::observability::{MetricsInterceptor, TracingInterceptor};

/// The inbound call path in front of a service's handlers.
#[derive(Clone, Debug)]
pub struct ServerStack {
    chain: Chain,
    limiter: Option<Arc<LimiterRegistry>>,
}

impl ServerStack {
    pub fn builder(handler: impl Endpoint) -> ServerStackBuilder {
        ServerStackBuilder::new(Arc::new(handler))
    }

    /// Recovery, tracing, metrics and rate limiting configured from `config`.
    pub fn from_config(handler: impl Endpoint, config: &ServerConfig) -> Self {
        Self::builder(handler)
            .recovery()
            .observability(TracingInterceptor::new())
            .observability(MetricsInterceptor::new(config.service_name.clone()))
            .rate_limiter(config.rate_limit.clone())
            .build()
    }

    /// Handle one inbound call.
    pub async fn handle(&self, ctx: &CallContext, req: Request) -> Result<Response, Status> {
        self.chain.call(ctx, req).await
    }

    /// The limiter registry, if rate limiting is installed.
    pub fn limiter(&self) -> Option<&Arc<LimiterRegistry>> {
        self.limiter.as_ref()
    }

    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }
}

/// Collects the server stages; [`build`](Self::build) always nests them in the
/// canonical order.
pub struct ServerStackBuilder {
    handler: Arc<dyn Endpoint>,
    recovery: Option<RecoveryGuard>,
    observability: Vec<Arc<dyn Interceptor>>,
    limiter: Option<Arc<LimiterRegistry>>,
    validation: Vec<Arc<dyn Interceptor>>,
    error_mapping: Option<Arc<dyn Interceptor>>,
}

impl ServerStackBuilder {
    pub fn new(handler: Arc<dyn Endpoint>) -> Self {
        Self {
            handler,
            recovery: None,
            observability: Vec::new(),
            limiter: None,
            validation: Vec::new(),
            error_mapping: None,
        }
    }

    pub fn recovery(mut self) -> Self {
        self.recovery = Some(RecoveryGuard::new());
        self
    }

    /// Add a metrics or tracing stage. Several may be added; they run in the
    /// order given.
    pub fn observability(mut self, interceptor: impl Interceptor) -> Self {
        self.observability.push(Arc::new(interceptor));
        self
    }

    pub fn rate_limiter(self, config: LimiterConfig) -> Self {
        self.shared_rate_limiter(Arc::new(LimiterRegistry::new(config)))
    }

    pub fn shared_rate_limiter(mut self, registry: Arc<LimiterRegistry>) -> Self {
        self.limiter = Some(registry);
        self
    }

    /// Add a request validation stage. Several may be added; they run in the
    /// order given.
    pub fn validation(mut self, interceptor: impl Interceptor) -> Self {
        self.validation.push(Arc::new(interceptor));
        self
    }

    /// Set the stage translating handler errors into their final status.
    pub fn error_mapping(mut self, interceptor: impl Interceptor) -> Self {
        self.error_mapping = Some(Arc::new(interceptor));
        self
    }

    pub fn build(self) -> ServerStack {
        let mut chain = ChainBuilder::new(self.handler);
        if let Some(recovery) = self.recovery {
            chain = chain.layer(recovery);
        }
        for stage in self.observability {
            chain = chain.layer_arc(stage);
        }
        if let Some(registry) = &self.limiter {
            chain = chain.layer(ServerRateLimiter::from_registry(Arc::clone(registry)));
        }
        for stage in self.validation {
            chain = chain.layer_arc(stage);
        }
        if let Some(mapping) = self.error_mapping {
            chain = chain.layer_arc(mapping);
        }

        ServerStack {
            chain: chain.build(),
            limiter: self.limiter,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use callguard_core::{endpoint_fn, Code, Next};
    use parking_lot::Mutex;

    #[derive(Clone, Default)]
    struct Log(Arc<Mutex<Vec<String>>>);

    impl Log {
        fn push(&self, entry: String) {
            self.0.lock().push(entry);
        }

        fn entries(&self) -> Vec<String> {
            self.0.lock().clone()
        }
    }

    struct Observe {
        log: Log,
    }

    #[async_trait]
    impl Interceptor for Observe {
        async fn intercept(
            &self,
            ctx: &CallContext,
            req: Request,
            next: Next<'_>,
        ) -> Result<Response, Status> {
            let result = next.run(ctx, req).await;
            let code = result.as_ref().map_or_else(|s| s.code(), |_| Code::Ok);
            self.log.push(format!("observed {code}"));
            result
        }
    }

    struct RequireName;

    #[async_trait]
    impl Interceptor for RequireName {
        async fn intercept(
            &self,
            ctx: &CallContext,
            req: Request,
            next: Next<'_>,
        ) -> Result<Response, Status> {
            if req.payload.get("name").is_none() {
                return Err(Status::invalid_argument("name is required"));
            }
            next.run(ctx, req).await
        }
    }

    /// Maps "not found" handler messages onto `NOT_FOUND`.
    struct MapErrors;

    #[async_trait]
    impl Interceptor for MapErrors {
        async fn intercept(
            &self,
            ctx: &CallContext,
            req: Request,
            next: Next<'_>,
        ) -> Result<Response, Status> {
            next.run(ctx, req).await.map_err(|status| {
                if status.message().contains("not found") {
                    Status::new(Code::NotFound, status.message())
                } else {
                    status
                }
            })
        }
    }

    fn handler() -> impl Endpoint {
        endpoint_fn(|_ctx, req: Request| async move {
            match req.payload["name"].as_str() {
                Some("ghost") => Err(Status::internal("user not found")),
                Some("boom") => panic!("handler bug"),
                _ => Ok(Response::new(req.payload)),
            }
        })
    }

    fn stack(log: &Log, registry: LimiterConfig) -> ServerStack {
        // Stages supplied out of order on purpose.
        ServerStack::builder(handler())
            .error_mapping(MapErrors)
            .validation(RequireName)
            .rate_limiter(registry)
            .observability(Observe { log: log.clone() })
            .recovery()
            .build()
    }

    fn lenient() -> LimiterConfig {
        LimiterConfig {
            default_limit: 1000.0,
            default_burst: 100,
            global_limit: 0.0,
            global_burst: 0,
            ..LimiterConfig::default()
        }
    }

    #[tokio::test]
    async fn observability_sees_mapped_status() {
        let log = Log::default();
        let stack = stack(&log, lenient());
        assert_eq!(stack.len(), 5);

        let err = stack
            .handle(
                &CallContext::new(),
                Request::new("/users.v1/Get", serde_json::json!({ "name": "ghost" })),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::NotFound);
        assert_eq!(log.entries(), vec!["observed NOT_FOUND"]);
    }

    #[tokio::test]
    async fn validation_runs_after_rate_limit() {
        let log = Log::default();
        let stack = stack(
            &log,
            LimiterConfig {
                default_limit: 0.0001,
                default_burst: 1,
                ..lenient()
            },
        );
        let ctx = CallContext::new();

        let invalid = stack
            .handle(&ctx, Request::empty("/users.v1/Create"))
            .await
            .unwrap_err();
        assert_eq!(invalid.code(), Code::InvalidArgument);

        // The rejected-by-validation call still consumed the only token.
        let limited = stack
            .handle(&ctx, Request::empty("/users.v1/Create"))
            .await
            .unwrap_err();
        assert_eq!(limited.code(), Code::ResourceExhausted);
        assert_eq!(
            log.entries(),
            vec!["observed INVALID_ARGUMENT", "observed RESOURCE_EXHAUSTED"]
        );
    }

    #[tokio::test]
    async fn panic_is_contained_outside_observability() {
        let log = Log::default();
        let stack = stack(&log, lenient());
        let ctx = CallContext::new();

        let err = stack
            .handle(
                &ctx,
                Request::new("/users.v1/Get", serde_json::json!({ "name": "boom" })),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Internal);
        // The panic unwound through observability before recovery caught it.
        assert!(log.entries().is_empty());

        let ok = stack
            .handle(
                &ctx,
                Request::new("/users.v1/Get", serde_json::json!({ "name": "alice" })),
            )
            .await
            .unwrap();
        assert_eq!(ok.payload["name"], "alice");
    }

    #[tokio::test]
    async fn from_config_installs_limiter() {
        let stack = ServerStack::from_config(handler(), &ServerConfig::default());
        assert_eq!(stack.len(), 4);
        assert!(stack.limiter().is_some());
    }
}
