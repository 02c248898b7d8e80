//! Metrics middleware for handler calls.
//!
//! Records call duration and outcome using `tracing` spans rather than a
//! metrics crate.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use busrpc_core::{CallEnvelope, HandlerFailure, Reply};
use tower::{Layer, Service};
use tracing::{info_span, Instrument};

// ---------------------------------------------------------------------------
// MetricsLayer
// ---------------------------------------------------------------------------

/// Tower layer that wraps each call in a `call` span tagged with the session.
#[derive(Debug, Clone)]
pub struct MetricsLayer {
    session: Arc<str>,
}

impl MetricsLayer {
    #[must_use]
    pub fn new(session: impl Into<Arc<str>>) -> Self {
        Self {
            session: session.into(),
        }
    }
}

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService {
            inner,
            session: Arc::clone(&self.session),
        }
    }
}

// ---------------------------------------------------------------------------
// MetricsService
// ---------------------------------------------------------------------------

/// Records call duration and outcome in tracing spans.
#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
    session: Arc<str>,
}

impl<S> Service<CallEnvelope> for MetricsService<S>
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
        let call_id = call.call_id.0;
        let span = info_span!(
            "call",
            session = %self.session,
            service = %call.service,
            method = %call.method,
            call_id = call_id,
            trace_id = %call.context.trace_id,
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        let fut = self.inner.call(call);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;

                let outcome = match &result {
                    Ok(reply) if reply.is_ok() => "ok",
                    Ok(_) => "error_reply",
                    Err(_) => "failed",
                };
                let duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
                tracing::Span::current().record("duration_ms", duration_ms);
                tracing::Span::current().record("outcome", outcome);

                tracing::debug!(call_id, duration_ms, outcome, "call complete");

                result
            }
            .instrument(span),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
