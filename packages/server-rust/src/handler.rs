//! The generic call handler invoked once per decoded call.

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;
use busrpc_core::{CallEnvelope, Reply};
use serde_json::Value;

/// Business logic behind every session. Receives the decoded call and
/// produces the reply sent back to the caller.
///
/// Errors are reported per the session's `HandlerErrorPolicy`.
#[async_trait]
pub trait GenericHandler: Send + Sync + 'static {
    async fn handle(&self, call: CallEnvelope) -> anyhow::Result<Reply>;
}

// ---------------------------------------------------------------------------
// FnHandler
// ---------------------------------------------------------------------------

/// Adapts an async closure into a `GenericHandler`.
pub struct FnHandler<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

/// Wraps `f` as a `GenericHandler`.
///
/// ```ignore
/// let handler = handler_fn(|call: CallEnvelope| async move {
///     Ok(Reply::ok(serde_json::Value::Object(call.payload)))
/// });
/// ```
#[must_use]
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F, Fut>
where
    F: Fn(CallEnvelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Reply>> + Send + 'static,
{
    FnHandler {
        f,
        _fut: PhantomData,
    }
}

#[async_trait]
impl<F, Fut> GenericHandler for FnHandler<F, Fut>
where
    F: Fn(CallEnvelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Reply>> + Send + 'static,
{
    async fn handle(&self, call: CallEnvelope) -> anyhow::Result<Reply> {
        (self.f)(call).await
    }
}

// ---------------------------------------------------------------------------
// EchoHandler
// ---------------------------------------------------------------------------

/// Replies with the request payload unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoHandler;

#[async_trait]
impl GenericHandler for EchoHandler {
    async fn handle(&self, call: CallEnvelope) -> anyhow::Result<Reply> {
        Ok(Reply::ok(Value::Object(call.payload)))
    }
}
