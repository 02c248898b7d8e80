//! One bus connection plus its request loop.
//!
//! A `ConnectionSession` is created per handler configuration. At start it
//! opens its own bus connection, registered service stubs subscribe through
//! a `SessionHandle`, and a loop task feeds queued calls through the handler
//! pipeline. Replies are matched to waiting callers by correlation id.
//!
//! State machine: Created -> Connected -> Running -> Draining -> Closed

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use busrpc_core::{
    CallContext, CallEnvelope, CallId, ConnectionSettings, HandlerFailure, HandlerSettings, Payload,
    ReplyEnvelope,
};
use dashmap::DashMap;
use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::task::TaskTracker;
use tower::ServiceExt;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::bus::{BusConnection, BusConnector};
use crate::config::{DispatcherConfig, HandlerErrorPolicy};
use crate::error::{CallError, DispatchError};
use crate::handler::GenericHandler;
use crate::middleware::{build_call_pipeline, CallPipeline};
use crate::options::ConnectionOptionBuilder;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

// ---------------------------------------------------------------------------
// SessionId / SessionState
// ---------------------------------------------------------------------------

/// Process-unique session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl SessionId {
    fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Configured, no connection yet.
    Created,
    /// Bus connection open, request channel ready, loop not started.
    Connected,
    /// Loop task processing calls.
    Running,
    /// Stop signalled; in-flight calls finishing.
    Draining,
    /// Connection drained and closed.
    Closed,
}

impl SessionState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Connected => "connected",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// SessionShared
// ---------------------------------------------------------------------------

/// State shared between the session, its handles, and its loop task.
struct SessionShared {
    id: SessionId,
    name: String,
    handler_settings: HandlerSettings,
    config: DispatcherConfig,
    state: ArcSwap<SessionState>,
    connection: RwLock<Option<Arc<dyn BusConnection>>>,
    request_tx: RwLock<Option<mpsc::Sender<CallEnvelope>>>,
    pending: DashMap<CallId, oneshot::Sender<ReplyEnvelope>>,
    next_call_id: AtomicU64,
    stop_tx: watch::Sender<bool>,
    tasks: TaskTracker,
}

impl SessionShared {
    fn state(&self) -> SessionState {
        **self.state.load()
    }

    fn set_state(&self, state: SessionState) {
        self.state.store(Arc::new(state));
    }

    fn invalid_state(&self, expected: &'static str) -> DispatchError {
        DispatchError::InvalidState {
            session: self.name.clone(),
            state: self.state().as_str(),
            expected,
        }
    }

    /// Runs one call through the pipeline and fills its reply slot. A
    /// panicking handler counts as a handler failure.
    async fn complete(&self, call: CallEnvelope, pipeline: CallPipeline) {
        let call_id = call.call_id;
        let outcome = match AssertUnwindSafe(pipeline.oneshot(call)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => {
                let reason = panic_reason(panic.as_ref());
                error!(session = %self.name, %call_id, %reason, "handler panicked");
                Err(HandlerFailure::new(format!("handler panicked: {reason}")))
            }
        };
        match outcome {
            Ok(reply) => self.deliver(call_id, Ok(reply)),
            Err(failure) => match self.config.handler_error_policy {
                HandlerErrorPolicy::Reply => {
                    warn!(session = %self.name, %call_id, reason = %failure.reason, "handler failed");
                    self.deliver(call_id, Err(failure));
                }
                HandlerErrorPolicy::Drop => {
                    // Slot stays parked; the caller removes it when it times out.
                    error!(session = %self.name, %call_id, reason = %failure.reason, "handler failed, reply dropped");
                }
            },
        }
    }

    fn deliver(&self, call_id: CallId, outcome: ReplyEnvelope) {
        match self.pending.remove(&call_id) {
            Some((_, slot)) => {
                if slot.send(outcome).is_err() {
                    debug!(session = %self.name, %call_id, "caller went away before reply");
                }
            }
            None => debug!(session = %self.name, %call_id, "no pending slot for reply"),
        }
    }
}

fn panic_reason(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn timeout_error(timeout: Duration) -> CallError {
    CallError::Timeout {
        timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
    }
}

/// Resolves once `stop` reads `true` or its sender is gone.
pub async fn wait_for_stop(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}

/// Receive/dispatch loop. Takes a concurrency permit before each call so
/// that `max_concurrent_calls = 1` processes calls one at a time in order.
async fn run_loop(
    shared: Arc<SessionShared>,
    mut rx: mpsc::Receiver<CallEnvelope>,
    pipeline: CallPipeline,
) {
    let mut stop = shared.stop_tx.subscribe();
    let permits = Arc::new(Semaphore::new(shared.config.max_concurrent_calls.max(1)));
    let mut in_flight = JoinSet::new();

    loop {
        while let Some(joined) = in_flight.try_join_next() {
            log_join_error(joined);
        }

        let permit = tokio::select! {
            biased;
            () = wait_for_stop(&mut stop) => break,
            permit = Arc::clone(&permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        let call = tokio::select! {
            biased;
            () = wait_for_stop(&mut stop) => break,
            call = rx.recv() => match call {
                Some(call) => call,
                None => break,
            },
        };

        debug!(call_id = %call.call_id, method = %call.method, "dispatching call");
        let shared = Arc::clone(&shared);
        let pipeline = pipeline.clone();
        in_flight.spawn(async move {
            let _permit = permit;
            shared.complete(call, pipeline).await;
        });
    }

    rx.close();
    let mut abandoned = 0usize;
    while let Ok(call) = rx.try_recv() {
        shared.pending.remove(&call.call_id);
        abandoned += 1;
    }
    if abandoned > 0 {
        debug!(abandoned, "queued calls abandoned at stop");
    }

    while let Some(joined) = in_flight.join_next().await {
        log_join_error(joined);
    }
    debug!("session loop exited");
}

fn log_join_error(joined: Result<(), tokio::task::JoinError>) {
    if let Err(err) = joined {
        error!(error = %err, "call task ended abnormally");
    }
}

// ---------------------------------------------------------------------------
// SessionHandle
// ---------------------------------------------------------------------------

/// Cloneable view of a session used by service stubs and callers.
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<SessionShared>,
}

impl SessionHandle {
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Protocol this session serves (`.proto` suffix removed).
    #[must_use]
    pub fn protocol(&self) -> &str {
        self.shared.handler_settings.protocol()
    }

    /// The one service this session expects, if configured.
    #[must_use]
    pub fn expected_service(&self) -> Option<&str> {
        self.shared.handler_settings.service_name.as_deref()
    }

    #[must_use]
    pub fn handler_error_policy(&self) -> HandlerErrorPolicy {
        self.shared.config.handler_error_policy
    }

    /// The session's bus connection, once established and until stopped.
    #[must_use]
    pub fn connection(&self) -> Option<Arc<dyn BusConnection>> {
        self.shared.connection.read().clone()
    }

    /// Receiver that flips to `true` when the session begins stopping.
    #[must_use]
    pub fn stop_signal(&self) -> watch::Receiver<bool> {
        self.shared.stop_tx.subscribe()
    }

    /// Spawns a task owned by the session. `stop()` waits for owned tasks
    /// after signalling stop, so they should watch `stop_signal()`.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.shared.tasks.spawn(task);
    }

    /// Calls waiting for a reply.
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.shared.pending.len()
    }

    /// Enqueue a call and wait for its reply.
    ///
    /// The outer `Result` reports calls that produced no reply; a handler
    /// failure under `HandlerErrorPolicy::Reply` arrives as `Ok(Err(_))`.
    ///
    /// # Errors
    ///
    /// - `NotRunning` if the session has no request channel.
    /// - `SessionClosed` if the session stopped before replying.
    /// - `Timeout` if no reply arrived within `call_timeout`.
    pub async fn call(
        &self,
        method: impl Into<String>,
        service: impl Into<String>,
        context: CallContext,
        payload: Payload,
    ) -> Result<ReplyEnvelope, CallError> {
        self.enqueue(method, service, context, payload)
            .await?
            .wait()
            .await
    }

    /// Places a call on the request channel and returns once it is queued.
    ///
    /// Calls enqueued one after another from a single task reach the
    /// handler in that order. `call_timeout` starts here and also covers
    /// `PendingCall::wait`.
    ///
    /// # Errors
    ///
    /// - `NotRunning` if the session has no request channel.
    /// - `SessionClosed` if the session stopped while the call was queued.
    /// - `Timeout` if the channel stayed full for `call_timeout`.
    pub async fn enqueue(
        &self,
        method: impl Into<String>,
        service: impl Into<String>,
        context: CallContext,
        payload: Payload,
    ) -> Result<PendingCall, CallError> {
        let tx = self
            .shared
            .request_tx
            .read()
            .clone()
            .ok_or(CallError::NotRunning)?;

        let call_id = CallId(self.shared.next_call_id.fetch_add(1, Ordering::Relaxed));
        let (slot, reply) = oneshot::channel();
        self.shared.pending.insert(call_id, slot);
        let pending = PendingCall {
            shared: Arc::clone(&self.shared),
            call_id,
            reply,
            deadline: Instant::now() + self.shared.config.call_timeout,
        };

        let envelope = CallEnvelope {
            call_id,
            method: method.into(),
            service: service.into(),
            context,
            payload,
        };
        match tokio::time::timeout_at(pending.deadline, tx.send(envelope)).await {
            Ok(Ok(())) => Ok(pending),
            Ok(Err(_)) => Err(CallError::SessionClosed),
            Err(_elapsed) => Err(timeout_error(self.shared.config.call_timeout)),
        }
    }
}

// ---------------------------------------------------------------------------
// PendingCall
// ---------------------------------------------------------------------------

/// A queued call awaiting its reply. Dropping it releases the reply slot.
pub struct PendingCall {
    shared: Arc<SessionShared>,
    call_id: CallId,
    reply: oneshot::Receiver<ReplyEnvelope>,
    deadline: Instant,
}

impl PendingCall {
    #[must_use]
    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    /// Waits for the reply until the call's deadline.
    ///
    /// # Errors
    ///
    /// - `SessionClosed` if the session stopped before replying.
    /// - `Timeout` if the deadline passed.
    pub async fn wait(mut self) -> Result<ReplyEnvelope, CallError> {
        match tokio::time::timeout_at(self.deadline, &mut self.reply).await {
            Ok(Ok(envelope)) => Ok(envelope),
            Ok(Err(_)) => Err(CallError::SessionClosed),
            Err(_elapsed) => Err(timeout_error(self.shared.config.call_timeout)),
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.shared.pending.remove(&self.call_id);
    }
}

impl fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCall")
            .field("session", &self.shared.name)
            .field("call_id", &self.call_id)
            .finish_non_exhaustive()
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .field("state", &self.shared.state())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ConnectionSession
// ---------------------------------------------------------------------------

/// A session owning one bus connection, one request channel, and one stop
/// signal.
pub struct ConnectionSession {
    shared: Arc<SessionShared>,
    settings: Arc<ConnectionSettings>,
    handler: Arc<dyn GenericHandler>,
    request_rx: Mutex<Option<mpsc::Receiver<CallEnvelope>>>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionSession {
    /// Creates a session in the `Created` state. No I/O happens here.
    #[must_use]
    pub fn new(
        settings: Arc<ConnectionSettings>,
        handler_settings: HandlerSettings,
        handler: Arc<dyn GenericHandler>,
        config: DispatcherConfig,
    ) -> Self {
        let id = SessionId::next();
        let name = match &handler_settings.service_name {
            Some(service) => format!("{id}:{}/{service}", handler_settings.protocol()),
            None => format!("{id}:{}", handler_settings.protocol()),
        };
        let (stop_tx, _stop_rx) = watch::channel(false);

        Self {
            shared: Arc::new(SessionShared {
                id,
                name,
                handler_settings,
                config,
                state: ArcSwap::from_pointee(SessionState::Created),
                connection: RwLock::new(None),
                request_tx: RwLock::new(None),
                pending: DashMap::new(),
                next_call_id: AtomicU64::new(1),
                stop_tx,
                tasks: TaskTracker::new(),
            }),
            settings,
            handler,
            request_rx: Mutex::new(None),
            loop_handle: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    #[must_use]
    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    #[must_use]
    pub fn handler_settings(&self) -> &HandlerSettings {
        &self.shared.handler_settings
    }

    /// Opens the bus connection and creates the request channel.
    ///
    /// # Errors
    ///
    /// - `InvalidState` unless the session is `Created`.
    /// - `Config` if the connection settings are invalid.
    /// - `Connection` if the bus cannot be reached.
    pub async fn establish(&self, connector: &dyn BusConnector) -> Result<(), DispatchError> {
        if self.state() != SessionState::Created {
            return Err(self.shared.invalid_state("created"));
        }

        let options = ConnectionOptionBuilder::build(&self.settings)?;
        info!(
            session = %self.shared.name,
            servers = %options.servers_display(),
            reconnect_disabled = options.reconnect.is_disabled(),
            tls = options.tls.is_some(),
            "connecting to bus"
        );
        let connection = connector.connect(&options).await?;

        let (tx, rx) = mpsc::channel(self.shared.config.channel_capacity.max(1));
        *self.shared.connection.write() = Some(connection);
        *self.shared.request_tx.write() = Some(tx);
        *self.request_rx.lock() = Some(rx);
        self.shared.set_state(SessionState::Connected);
        debug!(session = %self.shared.name, "session connected");
        Ok(())
    }

    /// Spawns the receive/dispatch loop.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless the session is `Connected`.
    pub fn run(&self) -> Result<(), DispatchError> {
        if self.state() != SessionState::Connected {
            return Err(self.shared.invalid_state("connected"));
        }
        let rx = self
            .request_rx
            .lock()
            .take()
            .ok_or_else(|| self.shared.invalid_state("connected"))?;

        let pipeline = build_call_pipeline(
            Arc::clone(&self.handler),
            &self.shared.name,
            &self.shared.config,
        );
        let span = info_span!("session", session = %self.shared.name);
        let handle = tokio::spawn(run_loop(Arc::clone(&self.shared), rx, pipeline).instrument(span));
        *self.loop_handle.lock() = Some(handle);
        self.shared.set_state(SessionState::Running);
        info!(session = %self.shared.name, "session running");
        Ok(())
    }

    /// Stops the session: signal, close the request channel, wait for
    /// in-flight calls and owned tasks, then drain and close the connection.
    ///
    /// Stopping a session that is already draining or closed is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `Connection` if closing the bus connection failed. The session
    /// is `Closed` either way.
    pub async fn stop(&self) -> Result<(), DispatchError> {
        let previous = self.shared.state.rcu(|current| match **current {
            SessionState::Draining | SessionState::Closed => Arc::clone(current),
            _ => Arc::new(SessionState::Draining),
        });
        if matches!(*previous, SessionState::Draining | SessionState::Closed) {
            debug!(session = %self.shared.name, state = %previous, "stop ignored");
            return Ok(());
        }
        info!(session = %self.shared.name, from = %previous, "stopping session");

        self.shared.stop_tx.send_replace(true);
        self.shared.request_tx.write().take();
        self.request_rx.lock().take();

        let drain_timeout = self.shared.config.drain_timeout;
        let loop_handle = self.loop_handle.lock().take();
        if let Some(mut handle) = loop_handle {
            match tokio::time::timeout(drain_timeout, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(session = %self.shared.name, error = %err, "session loop ended abnormally"),
                Err(_) => {
                    warn!(session = %self.shared.name, "drain timed out, abandoning in-flight calls");
                    handle.abort();
                }
            }
        }

        let abandoned = self.shared.pending.len();
        self.shared.pending.clear();
        if abandoned > 0 {
            debug!(session = %self.shared.name, abandoned, "pending calls released");
        }

        self.shared.tasks.close();
        if tokio::time::timeout(drain_timeout, self.shared.tasks.wait())
            .await
            .is_err()
        {
            warn!(session = %self.shared.name, "owned tasks did not stop in time");
        }

        let connection = self.shared.connection.write().take();
        let mut result = Ok(());
        if let Some(connection) = connection {
            if let Err(err) = connection.drain().await {
                warn!(session = %self.shared.name, error = %err, "connection drain failed");
            }
            if let Err(err) = connection.close().await {
                warn!(session = %self.shared.name, error = %err, "connection close failed");
                result = Err(err.into());
            }
        }

        self.shared.set_state(SessionState::Closed);
        info!(session = %self.shared.name, "session closed");
        result
    }
}

impl fmt::Debug for ConnectionSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSession")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .field("state", &self.shared.state())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
