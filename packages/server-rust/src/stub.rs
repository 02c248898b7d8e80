//! Table-driven server stub.
//!
//! `MethodTableService` serves a fixed list of methods for one service. Each
//! method gets its own queue subscription on `<protocol>.<service>.<method>`;
//! requests are decoded, forwarded through the session, and the encoded
//! `{code, data}` reply is published to the request's reply subject.

use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use busrpc_core::subject::{method_subject, queue_group};
use busrpc_core::{codes, decode_payload, CallContext, Reply, ServiceDescriptor};
use bytes::Bytes;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::{BusConnection, BusMessage, Subscription};
use crate::config::HandlerErrorPolicy;
use crate::error::{CallError, RegistrationError};
use crate::registry::ServiceImplementation;
use crate::session::{wait_for_stop, PendingCall, SessionHandle};

/// Serves `methods` of `descriptor` by forwarding each request to the
/// session's generic handler.
#[derive(Debug, Clone)]
pub struct MethodTableService {
    descriptor: ServiceDescriptor,
    methods: Vec<String>,
}

impl MethodTableService {
    #[must_use]
    pub fn new<I, S>(descriptor: ServiceDescriptor, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            descriptor,
            methods: methods.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl ServiceImplementation for MethodTableService {
    fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    async fn register(&self, session: &SessionHandle) -> anyhow::Result<()> {
        let connection = session
            .connection()
            .ok_or_else(|| anyhow!("session {} has no bus connection", session.name()))?;
        let group = queue_group(&self.descriptor);
        let service: Arc<str> = Arc::from(self.descriptor.service());

        for method in &self.methods {
            let subject = method_subject(&self.descriptor, method);
            let subscription = connection
                .subscribe(&subject, Some(&group))
                .await
                .map_err(|err| RegistrationError::Subscribe {
                    subject: subject.clone(),
                    reason: err.to_string(),
                })?;
            info!(session = %session.name(), %subject, queue_group = %group, "serving method");

            session.spawn(serve_method(
                session.clone(),
                Arc::clone(&connection),
                Arc::clone(&service),
                Arc::from(method.as_str()),
                subscription,
            ));
        }
        Ok(())
    }
}

/// Subscription loop for one method. Requests are queued on the session in
/// arrival order; waiting for the reply and publishing it happen in a
/// session-owned task so a slow call does not hold up the subscription.
async fn serve_method(
    session: SessionHandle,
    connection: Arc<dyn BusConnection>,
    service: Arc<str>,
    method: Arc<str>,
    mut subscription: Subscription,
) {
    let mut stop = session.stop_signal();
    loop {
        let message = tokio::select! {
            biased;
            () = wait_for_stop(&mut stop) => break,
            message = subscription.next() => match message {
                Some(message) => message,
                None => break,
            },
        };

        let queued = enqueue_request(&session, &service, &method, &message).await;
        let policy = session.handler_error_policy();
        let connection = Arc::clone(&connection);
        session.spawn(async move {
            let reply = match queued {
                Ok(pending) => match pending.wait().await {
                    Ok(Ok(reply)) => Some(reply),
                    Ok(Err(failure)) => Some(Reply::from_failure(&failure)),
                    Err(err) => call_error_reply(policy, &message.subject, &err),
                },
                Err(reply) => reply,
            };
            if let Some(reply) = reply {
                publish_reply(connection.as_ref(), &message, &reply).await;
            }
        });
    }
    debug!(subject = %subscription.subject(), "method subscription ended");
}

/// Decodes `message` and queues it on the session. On failure, returns the
/// reply to send instead, or `None` when nothing should be sent back.
async fn enqueue_request(
    session: &SessionHandle,
    service: &str,
    method: &str,
    message: &BusMessage,
) -> Result<PendingCall, Option<Reply>> {
    let payload = match decode_payload(&message.payload) {
        Ok(payload) => payload,
        Err(err) => {
            debug!(subject = %message.subject, error = %err, "undecodable request payload");
            return Err(Some(Reply::error(
                codes::BAD_REQUEST,
                format!("invalid request payload: {err}"),
            )));
        }
    };

    let context = CallContext::received(message.subject.clone(), message.reply.clone())
        .with_trace_id(Uuid::new_v4().to_string());

    session
        .enqueue(method, service, context, payload)
        .await
        .map_err(|err| call_error_reply(session.handler_error_policy(), &message.subject, &err))
}

/// Reply for a call that produced no handler outcome.
fn call_error_reply(policy: HandlerErrorPolicy, subject: &str, err: &CallError) -> Option<Reply> {
    match (err, policy) {
        (CallError::Timeout { .. }, HandlerErrorPolicy::Drop) => {
            debug!(%subject, "call timed out, no reply sent");
            None
        }
        _ => Some(Reply::error(codes::UNAVAILABLE, err.to_string())),
    }
}

async fn publish_reply(connection: &dyn BusConnection, message: &BusMessage, reply: &Reply) {
    let Some(reply_to) = &message.reply else {
        debug!(subject = %message.subject, code = reply.code, "request without reply subject, reply discarded");
        return;
    };
    match reply.to_bytes() {
        Ok(bytes) => {
            if let Err(err) = connection.publish(reply_to, None, Bytes::from(bytes)).await {
                warn!(subject = %message.subject, %reply_to, error = %err, "failed to publish reply");
            }
        }
        Err(err) => warn!(subject = %message.subject, error = %err, "failed to encode reply"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
