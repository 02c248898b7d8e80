//! Service registry: maps (protocol, service) to the implementation that
//! wires itself to a session at dispatcher start.

use std::sync::Arc;

use async_trait::async_trait;
use busrpc_core::ServiceDescriptor;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::session::SessionHandle;

// ---------------------------------------------------------------------------
// ServiceImplementation trait
// ---------------------------------------------------------------------------

/// A server-side service stub that can wire itself to a session.
///
/// Generated stubs and hand-written services implement this. `register`
/// typically subscribes one bus subject per method and forwards decoded
/// requests through `SessionHandle::call`.
#[async_trait]
pub trait ServiceImplementation: Send + Sync + 'static {
    /// The (protocol, service) pair this implementation serves.
    fn descriptor(&self) -> &ServiceDescriptor;

    /// Attach to `session`'s bus connection.
    async fn register(&self, session: &SessionHandle) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// ServiceRegistry
// ---------------------------------------------------------------------------

/// Registry of service implementations keyed by (protocol, service).
///
/// Registration order is preserved for `entries()`, which drives the strict
/// registration scan at dispatcher start. Re-registering a descriptor
/// replaces the implementation but keeps its original position.
pub struct ServiceRegistry {
    by_descriptor: DashMap<ServiceDescriptor, Arc<dyn ServiceImplementation>>,
    order: RwLock<Vec<ServiceDescriptor>>,
}

impl ServiceRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            by_descriptor: DashMap::new(),
            order: RwLock::new(Vec::new()),
        }
    }

    /// Register an implementation. Returns the implementation it replaced,
    /// if one was already registered under the same descriptor.
    pub fn register<T: ServiceImplementation>(
        &self,
        implementation: T,
    ) -> Option<Arc<dyn ServiceImplementation>> {
        self.register_arc(Arc::new(implementation))
    }

    /// Register an already shared implementation.
    pub fn register_arc(
        &self,
        implementation: Arc<dyn ServiceImplementation>,
    ) -> Option<Arc<dyn ServiceImplementation>> {
        let descriptor = implementation.descriptor().clone();
        let mut order = self.order.write();
        let replaced = self
            .by_descriptor
            .insert(descriptor.clone(), implementation);
        if replaced.is_some() {
            warn!(key = %descriptor.key(), %descriptor, "service re-registered, replacing previous implementation");
        } else {
            debug!(key = %descriptor.key(), %descriptor, "service registered");
            order.push(descriptor);
        }
        replaced
    }

    /// Look up the implementation for `(protocol, service)`.
    #[must_use]
    pub fn find(&self, protocol: &str, service: &str) -> Option<Arc<dyn ServiceImplementation>> {
        self.by_descriptor
            .get(&ServiceDescriptor::new(protocol, service))
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Every implementation serving `protocol`, in registration order.
    #[must_use]
    pub fn for_protocol(&self, protocol: &str) -> Vec<Arc<dyn ServiceImplementation>> {
        self.entries()
            .into_iter()
            .filter(|(descriptor, _)| descriptor.protocol() == protocol)
            .map(|(_, implementation)| implementation)
            .collect()
    }

    /// Snapshot of all entries in registration order.
    #[must_use]
    pub fn entries(&self) -> Vec<(ServiceDescriptor, Arc<dyn ServiceImplementation>)> {
        let order = self.order.read();
        order
            .iter()
            .filter_map(|descriptor| {
                self.by_descriptor
                    .get(descriptor)
                    .map(|entry| (descriptor.clone(), Arc::clone(entry.value())))
            })
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_descriptor.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_descriptor.is_empty()
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("services", &*self.order.read())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
