//! Process-local pub/sub bus.
//!
//! Subjects match exactly (no wildcards). Plain subscribers each receive every
//! message; members of a queue group share messages round-robin. Requests use
//! a private `_INBOX.<uuid>` reply subject, the same convention the NATS
//! client uses.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use busrpc_core::subject::INBOX_PREFIX;
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::StreamExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, trace};
use uuid::Uuid;

use super::{BusConnection, BusConnector, BusMessage, Subscription};
use crate::error::ConnectionError;
use crate::options::{AuthOptions, ConnectOptions};

/// Buffered messages per subscription before publishers wait.
const SUBSCRIPTION_CAPACITY: usize = 1024;

// ---------------------------------------------------------------------------
// Broker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Subscriber {
    connection: u64,
    queue_group: Option<String>,
    tx: mpsc::Sender<BusMessage>,
}

/// Connection lifecycle call recorded by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Drain(u64),
    Close(u64),
}

#[derive(Debug)]
struct Broker {
    subjects: DashMap<String, Vec<Subscriber>>,
    next_connection_id: AtomicU64,
    round_robin: AtomicUsize,
    reachable: AtomicBool,
    required_auth: RwLock<Option<AuthOptions>>,
    connects: AtomicU64,
    last_options: Mutex<Option<ConnectOptions>>,
    events: Mutex<Vec<ConnectionEvent>>,
}

impl Broker {
    fn new() -> Self {
        Self {
            subjects: DashMap::new(),
            next_connection_id: AtomicU64::new(1),
            round_robin: AtomicUsize::new(0),
            reachable: AtomicBool::new(true),
            required_auth: RwLock::new(None),
            connects: AtomicU64::new(0),
            last_options: Mutex::new(None),
            events: Mutex::new(Vec::new()),
        }
    }

    fn add(&self, subject: &str, subscriber: Subscriber) {
        self.subjects
            .entry(subject.to_string())
            .or_default()
            .push(subscriber);
    }

    /// Picks the senders a message on `subject` goes to, pruning subscribers
    /// whose receiving side has been dropped.
    fn targets(&self, subject: &str) -> Vec<mpsc::Sender<BusMessage>> {
        let Some(mut entry) = self.subjects.get_mut(subject) else {
            return Vec::new();
        };
        entry.retain(|s| !s.tx.is_closed());

        let mut targets = Vec::new();
        let mut groups: BTreeMap<&str, Vec<&Subscriber>> = BTreeMap::new();
        for subscriber in entry.iter() {
            match &subscriber.queue_group {
                None => targets.push(subscriber.tx.clone()),
                Some(group) => groups.entry(group.as_str()).or_default().push(subscriber),
            }
        }
        for members in groups.values() {
            let pick = self.round_robin.fetch_add(1, Ordering::Relaxed) % members.len();
            targets.push(members[pick].tx.clone());
        }
        targets
    }

    /// Delivers `message` and returns how many subscribers received it.
    async fn route(&self, message: BusMessage) -> usize {
        let targets = self.targets(&message.subject);
        let mut delivered = 0;
        for tx in targets {
            if tx.send(message.clone()).await.is_ok() {
                delivered += 1;
            }
        }
        trace!(subject = %message.subject, delivered, "routed message");
        delivered
    }

    fn remove_connection(&self, connection: u64) {
        for mut entry in self.subjects.iter_mut() {
            entry.retain(|s| s.connection != connection);
        }
    }
}

// ---------------------------------------------------------------------------
// InMemoryBus
// ---------------------------------------------------------------------------

/// Handle to a process-local bus. Clones share the same broker.
#[derive(Debug, Clone)]
pub struct InMemoryBus {
    broker: Arc<Broker>,
}

impl InMemoryBus {
    #[must_use]
    pub fn new() -> Self {
        Self {
            broker: Arc::new(Broker::new()),
        }
    }

    /// Opens a connection directly, bypassing option checks.
    #[must_use]
    pub fn connection(&self) -> Arc<InMemoryConnection> {
        Arc::new(InMemoryConnection {
            id: self.broker.next_connection_id.fetch_add(1, Ordering::Relaxed),
            broker: Arc::clone(&self.broker),
            closed: AtomicBool::new(false),
        })
    }

    /// When unreachable, `connect` fails as if no server answered.
    pub fn set_reachable(&self, reachable: bool) {
        self.broker.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Rejects connections whose auth options differ from `auth`.
    pub fn require_auth(&self, auth: AuthOptions) {
        *self.broker.required_auth.write() = Some(auth);
    }

    #[must_use]
    pub fn connect_count(&self) -> u64 {
        self.broker.connects.load(Ordering::SeqCst)
    }

    /// Options passed to the most recent `connect` call.
    #[must_use]
    pub fn last_options(&self) -> Option<ConnectOptions> {
        self.broker.last_options.lock().clone()
    }

    /// Every drain and close call made on this bus's connections, in order.
    #[must_use]
    pub fn connection_events(&self) -> Vec<ConnectionEvent> {
        self.broker.events.lock().clone()
    }

    /// Live subscribers on `subject`.
    #[must_use]
    pub fn subscriber_count(&self, subject: &str) -> usize {
        self.broker
            .subjects
            .get(subject)
            .map_or(0, |entry| entry.iter().filter(|s| !s.tx.is_closed()).count())
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BusConnector for InMemoryBus {
    async fn connect(
        &self,
        options: &ConnectOptions,
    ) -> Result<Arc<dyn BusConnection>, ConnectionError> {
        self.broker.connects.fetch_add(1, Ordering::SeqCst);
        *self.broker.last_options.lock() = Some(options.clone());

        if !self.broker.reachable.load(Ordering::SeqCst) {
            return Err(ConnectionError::Unreachable {
                servers: options.servers_display(),
                reason: "no servers available for connection".to_string(),
            });
        }
        if let Some(required) = self.broker.required_auth.read().as_ref() {
            if &options.auth != required {
                return Err(ConnectionError::Unreachable {
                    servers: options.servers_display(),
                    reason: "authorization violation".to_string(),
                });
            }
        }

        let connection = self.connection();
        debug!(connection = connection.id, name = ?options.name, "in-memory connection opened");
        Ok(connection)
    }
}

// ---------------------------------------------------------------------------
// InMemoryConnection
// ---------------------------------------------------------------------------

/// A connection to an `InMemoryBus`.
#[derive(Debug)]
pub struct InMemoryConnection {
    id: u64,
    broker: Arc<Broker>,
    closed: AtomicBool,
}

impl InMemoryConnection {
    fn ensure_open(&self) -> Result<(), ConnectionError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(ConnectionError::Closed)
        } else {
            Ok(())
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }
}

#[async_trait]
impl BusConnection for InMemoryConnection {
    async fn subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
    ) -> Result<Subscription, ConnectionError> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        self.broker.add(
            subject,
            Subscriber {
                connection: self.id,
                queue_group: queue_group.map(str::to_string),
                tx,
            },
        );
        let messages =
            futures_util::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|m| (m, rx)) })
                .boxed();
        Ok(Subscription::new(subject, messages))
    }

    async fn publish(
        &self,
        subject: &str,
        reply: Option<&str>,
        payload: Bytes,
    ) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        self.broker
            .route(BusMessage {
                subject: subject.to_string(),
                reply: reply.map(str::to_string),
                payload,
            })
            .await;
        Ok(())
    }

    async fn request(
        &self,
        subject: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<BusMessage, ConnectionError> {
        self.ensure_open()?;
        let inbox = format!("{INBOX_PREFIX}.{}", Uuid::new_v4().simple());
        let mut replies = self.subscribe(&inbox, None).await?;

        let delivered = self
            .broker
            .route(BusMessage {
                subject: subject.to_string(),
                reply: Some(inbox),
                payload,
            })
            .await;
        if delivered == 0 {
            return Err(ConnectionError::NoResponders {
                subject: subject.to_string(),
            });
        }

        match tokio::time::timeout(timeout, replies.next()).await {
            Ok(Some(message)) => Ok(message),
            Ok(None) => Err(ConnectionError::Closed),
            Err(_) => Err(ConnectionError::RequestTimeout {
                subject: subject.to_string(),
            }),
        }
    }

    async fn drain(&self) -> Result<(), ConnectionError> {
        self.ensure_open()?;
        self.broker.events.lock().push(ConnectionEvent::Drain(self.id));
        self.broker.remove_connection(self.id);
        Ok(())
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        self.broker.events.lock().push(ConnectionEvent::Close(self.id));
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.broker.remove_connection(self.id);
        debug!(connection = self.id, "in-memory connection closed");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
