//! Observability stages for the server stack: a tracing span and metrics per
//! call.
//!
//! Metrics go through the `metrics` facade, so whichever recorder the service
//! installs (Prometheus exporter, statsd, ...) receives them. Without a
//! recorder every update is a no-op.

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::Instrument;

use callguard_core::{CallContext, Code, Interceptor, Next, Request, Response, Status};

/// Counter of finished calls, labelled `method`, `code`, `service`.
pub const REQUESTS_TOTAL: &str = "rpc_requests_total";
/// Counter of calls that ended in an error, labelled `method`, `code`, `service`.
pub const ERRORS_TOTAL: &str = "rpc_errors_total";
/// Histogram of call latency in seconds, labelled `method`, `service`.
pub const REQUEST_DURATION_SECONDS: &str = "rpc_request_duration_seconds";
/// Gauge of calls currently inside the stage, labelled `service`.
pub const ACTIVE_REQUESTS: &str = "rpc_active_requests";

fn status_code(result: &Result<Response, Status>) -> Code {
    match result {
        Ok(_) => Code::Ok,
        Err(status) => status.code(),
    }
}

/// Opens a span per call and logs the final status and latency.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingInterceptor;

impl TracingInterceptor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Interceptor for TracingInterceptor {
    async fn intercept(
        &self,
        ctx: &CallContext,
        req: Request,
        next: Next<'_>,
    ) -> Result<Response, Status> {
        let span = tracing::info_span!("rpc", rpc.method = %req.method);
        let start = Instant::now();
        let result = next.run(ctx, req).instrument(span.clone()).await;

        let code = status_code(&result);
        span.in_scope(|| {
            tracing::debug!(
                code = %code,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "call finished"
            );
        });
        result
    }
}

/// Records request and error totals, latency and in-flight calls.
#[derive(Debug, Clone)]
pub struct MetricsInterceptor {
    service: String,
}

impl MetricsInterceptor {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }
}

/// Holds the in-flight gauge up until dropped, including on unwind.
struct InFlight(metrics::Gauge);

impl InFlight {
    fn enter(service: &str) -> Self {
        let gauge = metrics::gauge!(ACTIVE_REQUESTS, "service" => service.to_string());
        gauge.increment(1.0);
        Self(gauge)
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.decrement(1.0);
    }
}

#[async_trait]
impl Interceptor for MetricsInterceptor {
    async fn intercept(
        &self,
        ctx: &CallContext,
        req: Request,
        next: Next<'_>,
    ) -> Result<Response, Status> {
        let method = req.method.clone();
        let _in_flight = InFlight::enter(&self.service);
        let start = Instant::now();

        let result = next.run(ctx, req).await;

        let code = status_code(&result);
        metrics::counter!(
            REQUESTS_TOTAL,
            "method" => method.clone(),
            "code" => code.as_str(),
            "service" => self.service.clone()
        )
        .increment(1);
        metrics::histogram!(
            REQUEST_DURATION_SECONDS,
            "method" => method.clone(),
            "service" => self.service.clone()
        )
        .record(start.elapsed().as_secs_f64());
        if result.is_err() {
            metrics::counter!(
                ERRORS_TOTAL,
                "method" => method,
                "code" => code.as_str(),
                "service" => self.service.clone()
            )
            .increment(1);
        }

        result
    }
}
