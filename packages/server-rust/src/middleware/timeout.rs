//! Timeout middleware for handler calls.
//!
//! Fails calls whose handler runs longer than the configured limit with a
//! `HandlerFailure`. Without a limit the call is passed through untouched.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use busrpc_core::{CallEnvelope, HandlerFailure, Reply};
use tower::{Layer, Service};

// ---------------------------------------------------------------------------
// TimeoutLayer
// ---------------------------------------------------------------------------

/// Tower layer that bounds each handler invocation.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutLayer {
    limit: Option<Duration>,
}

impl TimeoutLayer {
    #[must_use]
    pub fn new(limit: Option<Duration>) -> Self {
        Self { limit }
    }
}

impl<S> Layer<S> for TimeoutLayer {
    type Service = TimeoutService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TimeoutService {
            inner,
            limit: self.limit,
        }
    }
}

// ---------------------------------------------------------------------------
// TimeoutService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TimeoutService<S> {
    inner: S,
    limit: Option<Duration>,
}

impl<S> Service<CallEnvelope> for TimeoutService<S>
where
    S: Service<CallEnvelope, Response = Reply, Error = HandlerFailure> + Send,
    S::Future: Send + 'static,
{
    type Response = Reply;
    type Error = HandlerFailure;
    type Future = Pin<Box<dyn Future<Output = Result<Reply, HandlerFailure>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, call: CallEnvelope) -> Self::Future {
        let limit = self.limit;
        let fut = self.inner.call(call);
        Box::pin(async move {
            let Some(limit) = limit else {
                return fut.await;
            };
            match tokio::time::timeout(limit, fut).await {
                Ok(result) => result,
                Err(_elapsed) => Err(HandlerFailure::new(format!(
                    "handler timed out after {}ms",
                    limit.as_millis()
                ))),
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use busrpc_core::{CallContext, CallId, Payload};
    use tower::ServiceExt;

    use super::*;

    /// Service that takes a configurable delay before responding.
    struct SlowService {
        delay_ms: u64,
    }

    impl Service<CallEnvelope> for SlowService {
        type Response = Reply;
        type Error = HandlerFailure;
        type Future = Pin<Box<dyn Future<Output = Result<Reply, HandlerFailure>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, _call: CallEnvelope) -> Self::Future {
            let delay = self.delay_ms;
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Ok(Reply::ack())
            })
        }
    }

    fn make_call() -> CallEnvelope {
        CallEnvelope {
            call_id: CallId(1),
            method: "Slow".into(),
            service: "SlowService".into(),
            context: CallContext::default(),
            payload: Payload::new(),
        }
    }

    #[tokio::test]
    async fn completes_within_timeout() {
        let svc = TimeoutLayer::new(Some(Duration::from_secs(1))).layer(SlowService { delay_ms: 10 });
        let reply = svc.oneshot(make_call()).await.unwrap();
        assert_eq!(reply, Reply::ack());
    }

    #[tokio::test]
    async fn exceeds_timeout_returns_failure() {
        let svc = TimeoutLayer::new(Some(Duration::from_millis(50))).layer(SlowService { delay_ms: 200 });
        let err = svc.oneshot(make_call()).await.unwrap_err();
        assert_eq!(err.reason, "handler timed out after 50ms");
    }

    #[tokio::test]
    async fn no_limit_waits() {
        let svc = TimeoutLayer::new(None).layer(SlowService { delay_ms: 30 });
        assert!(svc.oneshot(make_call()).await.is_ok());
    }
}
