//! Panic containment for server handlers.

use std::any::Any;
use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures::FutureExt;

use crate::context::CallContext;
use crate::interceptor::{Interceptor, Next};
use crate::request::{Request, Response};
use crate::status::Status;

/// Server interceptor that turns a panic anywhere inside it into an
/// `Internal` status.
///
/// Place it outermost so that no other stage's panic escapes. The task
/// serving the call keeps running and later calls are unaffected.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecoveryGuard;

impl RecoveryGuard {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Interceptor for RecoveryGuard {
    async fn intercept(
        &self,
        ctx: &CallContext,
        req: Request,
        next: Next<'_>,
    ) -> Result<Response, Status> {
        let method = req.method.clone();
        match AssertUnwindSafe(next.run(ctx, req)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                tracing::error!(%method, panic = %panic_message(panic.as_ref()), "panic recovered");
                Err(Status::internal("internal server error"))
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interceptor::{endpoint_fn, Chain};
    use crate::status::Code;
    use serde_json::json;

    fn flaky_chain() -> Chain {
        Chain::builder(endpoint_fn(|_ctx, req: Request| async move {
            match req.method.as_str() {
                "/panic/str" => panic!("nil map access"),
                "/panic/any" => std::panic::panic_any(42_u8),
                _ => Ok::<_, Status>(Response::new(json!("ok"))),
            }
        }))
        .layer(RecoveryGuard::new())
        .build()
    }

    #[tokio::test]
    async fn panic_becomes_internal_and_chain_stays_usable() {
        let chain = flaky_chain();
        let ctx = CallContext::new();

        for method in ["/panic/str", "/panic/any"] {
            let err = chain.call(&ctx, Request::empty(method)).await.unwrap_err();
            assert_eq!(err.code(), Code::Internal);
            assert_eq!(err.message(), "internal server error");
        }

        let resp = chain.call(&ctx, Request::empty("/ok")).await.unwrap();
        assert_eq!(resp.payload, json!("ok"));
    }

    #[tokio::test]
    async fn errors_pass_through_untouched() {
        let chain = Chain::builder(endpoint_fn(|_ctx, _req| async {
            Err::<Response, _>(Status::new(Code::NotFound, "user not found"))
        }))
        .layer(RecoveryGuard::new())
        .build();

        let err = chain
            .call(&CallContext::new(), Request::empty("/get"))
            .await
            .unwrap_err();
        assert_eq!(err, Status::new(Code::NotFound, "user not found"));
    }

    #[test]
    fn extracts_panic_messages() {
        let boxed: Box<dyn Any + Send> = Box::new("static message");
        assert_eq!(panic_message(boxed.as_ref()), "static message");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(7_i32);
        assert_eq!(panic_message(boxed.as_ref()), "non-string panic payload");
    }
}
