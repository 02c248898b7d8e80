//! Pipeline composition: wraps the generic handler with the middleware stack.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use busrpc_core::{CallEnvelope, HandlerFailure, Reply};
use tower::util::BoxCloneService;
use tower::{Service, ServiceBuilder};

use super::metrics::MetricsLayer;
use super::timeout::TimeoutLayer;
use crate::config::DispatcherConfig;
use crate::handler::GenericHandler;

/// The boxed per-session call pipeline.
pub type CallPipeline = BoxCloneService<CallEnvelope, Reply, HandlerFailure>;

// ---------------------------------------------------------------------------
// HandlerService
// ---------------------------------------------------------------------------

/// Innermost service: invokes the `GenericHandler` and flattens its error
/// chain into a `HandlerFailure`.
#[derive(Clone)]
pub struct HandlerService {
    handler: Arc<dyn GenericHandler>,
}

impl HandlerService {
    #[must_use]
    pub fn new(handler: Arc<dyn GenericHandler>) -> Self {
        Self { handler }
    }
}

impl Service<CallEnvelope> for HandlerService {
    type Response = Reply;
    type Error = HandlerFailure;
    type Future = Pin<Box<dyn Future<Output = Result<Reply, HandlerFailure>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, call: CallEnvelope) -> Self::Future {
        let handler = Arc::clone(&self.handler);
        Box::pin(async move {
            handler
                .handle(call)
                .await
                .map_err(|e| HandlerFailure::new(format!("{e:#}")))
        })
    }
}

/// Build the call pipeline for one session.
///
/// Layer order (outermost to innermost):
/// 1. `MetricsLayer` -- record timing and outcome, including timeouts
/// 2. `TimeoutLayer` -- enforce `handler_timeout` when configured
/// 3. `HandlerService` -- the generic handler
#[must_use]
pub fn build_call_pipeline(
    handler: Arc<dyn GenericHandler>,
    session: &str,
    config: &DispatcherConfig,
) -> CallPipeline {
    BoxCloneService::new(
        ServiceBuilder::new()
            .layer(MetricsLayer::new(session))
            .layer(TimeoutLayer::new(config.handler_timeout))
            .service(HandlerService::new(handler)),
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use anyhow::Context as _;
    use busrpc_core::{CallContext, CallId, Payload};
    use serde_json::json;
    use tower::ServiceExt;

    use super::*;
    use crate::handler::handler_fn;

    fn make_call(method: &str) -> CallEnvelope {
        CallEnvelope {
            call_id: CallId(7),
            method: method.into(),
            service: "EchoService".into(),
            context: CallContext::default(),
            payload: Payload::new(),
        }
    }

    fn handler() -> Arc<dyn GenericHandler> {
        Arc::new(handler_fn(|call: CallEnvelope| async move {
            match call.method.as_str() {
                "Slow" => {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok(Reply::ack())
                }
                "Broken" => Err(anyhow::anyhow!("disk full")).context("writing record"),
                _ => Ok(Reply::ok(json!({ "method": call.method }))),
            }
        }))
    }

    #[tokio::test]
    async fn pipeline_routes_through_all_layers() {
        let svc = build_call_pipeline(handler(), "s", &DispatcherConfig::default());
        let reply = svc.oneshot(make_call("Echo")).await.unwrap();
        assert_eq!(reply.data, Some(json!({"method": "Echo"})));
    }

    #[tokio::test]
    async fn handler_error_chain_is_flattened() {
        let svc = build_call_pipeline(handler(), "s", &DispatcherConfig::default());
        let err = svc.oneshot(make_call("Broken")).await.unwrap_err();
        assert_eq!(err.reason, "writing record: disk full");
    }

    #[tokio::test]
    async fn handler_timeout_applies() {
        let config = DispatcherConfig {
            handler_timeout: Some(Duration::from_millis(20)),
            ..DispatcherConfig::default()
        };
        let svc = build_call_pipeline(handler(), "s", &config);
        let err = svc.oneshot(make_call("Slow")).await.unwrap_err();
        assert!(err.reason.contains("timed out"));
    }
}
