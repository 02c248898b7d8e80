//! Trigger lifecycle: initialize sessions, wire services at start, stop.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use busrpc_core::{ConnectionSettings, HandlerSettings, ServiceDescriptor};
use tracing::{debug, error, info, warn};

use crate::bus::BusConnector;
use crate::config::{DispatcherConfig, RegistrationMode};
use crate::error::{DispatchError, RegistrationError};
use crate::handler::GenericHandler;
use crate::registry::{ServiceImplementation, ServiceRegistry};
use crate::session::{ConnectionSession, SessionHandle};

// ---------------------------------------------------------------------------
// HandlerConfig
// ---------------------------------------------------------------------------

/// One external handler: which protocol/service it serves and the business
/// logic behind it. Each becomes one session.
#[derive(Clone)]
pub struct HandlerConfig {
    pub settings: HandlerSettings,
    pub handler: Arc<dyn GenericHandler>,
}

impl HandlerConfig {
    #[must_use]
    pub fn new(settings: HandlerSettings, handler: impl GenericHandler) -> Self {
        Self {
            settings,
            handler: Arc::new(handler),
        }
    }
}

impl fmt::Debug for HandlerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerConfig")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Owns one `ConnectionSession` per handler configuration and drives them
/// through start and stop.
pub struct Dispatcher {
    settings: Arc<ConnectionSettings>,
    registry: Arc<ServiceRegistry>,
    connector: Arc<dyn BusConnector>,
    config: DispatcherConfig,
    sessions: Vec<ConnectionSession>,
    initialized: bool,
    started: AtomicBool,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        settings: ConnectionSettings,
        registry: Arc<ServiceRegistry>,
        connector: Arc<dyn BusConnector>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            settings: Arc::new(settings),
            registry,
            connector,
            config,
            sessions: Vec::new(),
            initialized: false,
            started: AtomicBool::new(false),
        }
    }

    /// Creates one unconnected session per handler configuration.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyInitialized` on a second call.
    pub fn initialize(&mut self, handlers: Vec<HandlerConfig>) -> Result<(), DispatchError> {
        if self.initialized {
            return Err(DispatchError::AlreadyInitialized);
        }
        debug!(settings = ?self.settings, "initializing dispatcher");

        for handler in handlers {
            let session = ConnectionSession::new(
                Arc::clone(&self.settings),
                handler.settings,
                handler.handler,
                self.config.clone(),
            );
            debug!(session = %session.name(), "session created");
            self.sessions.push(session);
        }
        self.initialized = true;
        Ok(())
    }

    /// Connects every session, wires matching services, and starts the
    /// session loops. On failure, sessions started so far are stopped.
    ///
    /// # Errors
    ///
    /// - `Config` / `Connection` if a session cannot connect.
    /// - `Registration` if no matching service is registered.
    /// - `AlreadyStarted` on a second call; running sessions are untouched.
    pub async fn start(&self) -> Result<(), DispatchError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(DispatchError::AlreadyStarted);
        }
        info!(
            sessions = self.sessions.len(),
            services = self.registry.len(),
            mode = ?self.config.registration_mode,
            "starting dispatcher"
        );

        for (index, session) in self.sessions.iter().enumerate() {
            if let Err(err) = self.start_session(session).await {
                error!(session = %session.name(), error = %err, "session failed to start");
                for started in &self.sessions[..=index] {
                    if let Err(stop_err) = started.stop().await {
                        warn!(session = %started.name(), error = %stop_err, "rollback stop failed");
                    }
                }
                return Err(err);
            }
        }
        info!("dispatcher started");
        Ok(())
    }

    /// Stops every session. All sessions are attempted; the first error is
    /// returned.
    ///
    /// # Errors
    ///
    /// Returns the first session stop error.
    pub async fn stop(&self) -> Result<(), DispatchError> {
        info!(sessions = self.sessions.len(), "stopping dispatcher");
        let mut first_error = None;
        for session in &self.sessions {
            if let Err(err) = session.stop().await {
                warn!(session = %session.name(), error = %err, "session stop failed");
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => {
                info!("dispatcher stopped");
                Ok(())
            }
        }
    }

    /// Handles to every session, in handler order.
    #[must_use]
    pub fn sessions(&self) -> Vec<SessionHandle> {
        self.sessions.iter().map(ConnectionSession::handle).collect()
    }

    #[must_use]
    pub fn session_handle(&self, index: usize) -> Option<SessionHandle> {
        self.sessions.get(index).map(ConnectionSession::handle)
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    async fn start_session(&self, session: &ConnectionSession) -> Result<(), DispatchError> {
        session.establish(self.connector.as_ref()).await?;

        let handle = session.handle();
        let services = self.select_services(session.handler_settings())?;
        for implementation in services {
            let descriptor = implementation.descriptor().clone();
            implementation
                .register(&handle)
                .await
                .map_err(|source| match source.downcast::<RegistrationError>() {
                    Ok(err) => err,
                    Err(source) => RegistrationError::Service {
                        service: descriptor.to_string(),
                        source,
                    },
                })?;
            info!(
                session = %session.name(),
                protocol = %descriptor.protocol(),
                service = %descriptor.service(),
                "registered service"
            );
        }

        session.run()
    }

    /// Chooses the implementations to wire to a session per the configured
    /// `RegistrationMode`.
    fn select_services(
        &self,
        handler: &HandlerSettings,
    ) -> Result<Vec<Arc<dyn ServiceImplementation>>, RegistrationError> {
        if self.registry.is_empty() {
            return Err(RegistrationError::NoServices);
        }
        let protocol = handler.protocol();
        let expected = handler.service_name.as_deref();

        match self.config.registration_mode {
            RegistrationMode::Strict => {
                let mut selected = Vec::new();
                for (descriptor, implementation) in self.registry.entries() {
                    let matched = match expected {
                        Some(service) => descriptor.matches(protocol, service),
                        None => descriptor.protocol() == protocol,
                    };
                    if !matched {
                        return Err(not_registered(protocol, &descriptor));
                    }
                    selected.push(implementation);
                }
                Ok(selected)
            }
            RegistrationMode::Lookup => match expected {
                Some(service) => self
                    .registry
                    .find(protocol, service)
                    .map(|implementation| vec![implementation])
                    .ok_or_else(|| RegistrationError::NotRegistered {
                        protocol: protocol.to_string(),
                        service: service.to_string(),
                    }),
                None => {
                    let selected = self.registry.for_protocol(protocol);
                    if selected.is_empty() {
                        return Err(RegistrationError::NotRegistered {
                            protocol: protocol.to_string(),
                            service: "*".to_string(),
                        });
                    }
                    Ok(selected)
                }
            },
        }
    }
}

fn not_registered(protocol: &str, entry: &ServiceDescriptor) -> RegistrationError {
    RegistrationError::NotRegistered {
        protocol: protocol.to_string(),
        service: entry.service().to_string(),
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("sessions", &self.sessions)
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use crate::bus::InMemoryBus;
    use crate::error::{ConfigError, ConnectionError};
    use crate::handler::EchoHandler;
    use crate::session::SessionState;
    use crate::stub::MethodTableService;

    use super::*;

    fn echo_service(protocol: &str, service: &str) -> MethodTableService {
        MethodTableService::new(ServiceDescriptor::new(protocol, service), ["Echo"])
    }

    fn dispatcher(
        bus: &InMemoryBus,
        registry: ServiceRegistry,
        config: DispatcherConfig,
        handlers: Vec<HandlerConfig>,
    ) -> Dispatcher {
        let mut dispatcher = Dispatcher::new(
            ConnectionSettings::with_urls(["memory://local"]),
            Arc::new(registry),
            Arc::new(bus.clone()),
            config,
        );
        dispatcher.initialize(handlers).unwrap();
        dispatcher
    }

    fn echo_handler(service: Option<&str>) -> HandlerConfig {
        let settings = HandlerSettings::new("echo.proto");
        let settings = match service {
            Some(service) => settings.with_service(service),
            None => settings,
        };
        HandlerConfig::new(settings, EchoHandler)
    }

    #[tokio::test]
    async fn initialize_twice_fails() {
        let bus = InMemoryBus::new();
        let mut dispatcher = dispatcher(
            &bus,
            ServiceRegistry::new(),
            DispatcherConfig::default(),
            vec![echo_handler(None)],
        );
        assert!(matches!(
            dispatcher.initialize(vec![]),
            Err(DispatchError::AlreadyInitialized)
        ));
        assert_eq!(dispatcher.sessions().len(), 1);
        assert_eq!(dispatcher.sessions()[0].state(), SessionState::Created);
        assert_eq!(bus.connect_count(), 0);
    }

    #[tokio::test]
    async fn empty_registry_is_not_registered() {
        let bus = InMemoryBus::new();
        let dispatcher = dispatcher(
            &bus,
            ServiceRegistry::new(),
            DispatcherConfig::default(),
            vec![echo_handler(Some("EchoService"))],
        );

        let err = dispatcher.start().await.unwrap_err();
        assert!(err.is_not_registered());
        assert_eq!(err.to_string(), "no server services registered");
        assert_eq!(dispatcher.sessions()[0].state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn expected_service_missing_is_not_registered() {
        let bus = InMemoryBus::new();
        for mode in [RegistrationMode::Strict, RegistrationMode::Lookup] {
            let config = DispatcherConfig {
                registration_mode: mode,
                ..DispatcherConfig::default()
            };
            let registry = ServiceRegistry::new();
            registry.register(echo_service("echo", "barService"));
            let dispatcher = dispatcher(&bus, registry, config, vec![echo_handler(Some("fooService"))]);

            let err = dispatcher.start().await.unwrap_err();
            assert!(err.is_not_registered(), "{mode:?}: {err}");
        }
    }

    #[tokio::test]
    async fn strict_scan_fails_on_unrelated_entry_lookup_does_not() {
        let bus = InMemoryBus::new();
        let build_registry = || {
            let registry = ServiceRegistry::new();
            registry.register(echo_service("echo", "EchoService"));
            registry.register(echo_service("math", "Calc"));
            registry
        };

        let strict = dispatcher(
            &bus,
            build_registry(),
            DispatcherConfig::default(),
            vec![echo_handler(Some("EchoService"))],
        );
        let err = strict.start().await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "protocol [echo] and service [Calc] not registered"
        );

        let lookup = dispatcher(
            &bus,
            build_registry(),
            DispatcherConfig {
                registration_mode: RegistrationMode::Lookup,
                ..DispatcherConfig::default()
            },
            vec![echo_handler(Some("EchoService"))],
        );
        lookup.start().await.unwrap();
        assert_eq!(bus.subscriber_count("echo.EchoService.Echo"), 1);
        assert_eq!(bus.subscriber_count("math.Calc.Echo"), 0);
        lookup.stop().await.unwrap();
    }

    #[tokio::test]
    async fn session_without_service_takes_whole_protocol() {
        let bus = InMemoryBus::new();
        let registry = ServiceRegistry::new();
        registry.register(echo_service("echo", "A"));
        registry.register(echo_service("echo", "B"));

        let dispatcher = dispatcher(&bus, registry, DispatcherConfig::default(), vec![echo_handler(None)]);
        dispatcher.start().await.unwrap();
        assert_eq!(bus.subscriber_count("echo.A.Echo"), 1);
        assert_eq!(bus.subscriber_count("echo.B.Echo"), 1);
        dispatcher.stop().await.unwrap();
    }

    #[tokio::test]
    async fn connection_failure_aborts_start() {
        let bus = InMemoryBus::new();
        bus.set_reachable(false);
        let registry = ServiceRegistry::new();
        registry.register(echo_service("echo", "EchoService"));
        let dispatcher = dispatcher(
            &bus,
            registry,
            DispatcherConfig::default(),
            vec![echo_handler(Some("EchoService"))],
        );

        let err = dispatcher.start().await.unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Connection(ConnectionError::Unreachable { .. })
        ));
    }

    #[tokio::test]
    async fn invalid_settings_abort_start() {
        let bus = InMemoryBus::new();
        let registry = ServiceRegistry::new();
        registry.register(echo_service("echo", "EchoService"));
        let mut dispatcher = Dispatcher::new(
            ConnectionSettings {
                cert_file: Some("/tls/cert.pem".into()),
                key_file: Some("/tls/key.pem".into()),
                ..ConnectionSettings::with_urls(["memory://local"])
            },
            Arc::new(registry),
            Arc::new(bus.clone()),
            DispatcherConfig::default(),
        );
        dispatcher.initialize(vec![echo_handler(Some("EchoService"))]).unwrap();

        let err = dispatcher.start().await.unwrap_err();
        assert!(matches!(err, DispatchError::Config(ConfigError::MissingCaFile)));
        assert_eq!(bus.connect_count(), 0);
    }

    #[tokio::test]
    async fn second_start_leaves_running_sessions_alone() {
        let bus = InMemoryBus::new();
        let registry = ServiceRegistry::new();
        registry.register(echo_service("echo", "EchoService"));
        let dispatcher = dispatcher(
            &bus,
            registry,
            DispatcherConfig::default(),
            vec![echo_handler(Some("EchoService"))],
        );

        dispatcher.start().await.unwrap();
        let err = dispatcher.start().await.unwrap_err();
        assert!(matches!(err, DispatchError::AlreadyStarted));
        assert_eq!(bus.connect_count(), 1);
        assert_eq!(dispatcher.sessions()[0].state(), SessionState::Running);
        assert_eq!(bus.subscriber_count("echo.EchoService.Echo"), 1);

        dispatcher.stop().await.unwrap();
    }

    #[tokio::test]
    async fn strict_scan_compares_protocol_and_service_separately() {
        let bus = InMemoryBus::new();
        let registry = ServiceRegistry::new();
        registry.register(echo_service("ab", "c"));
        let mut dispatcher = Dispatcher::new(
            ConnectionSettings::with_urls(["memory://local"]),
            Arc::new(registry),
            Arc::new(bus.clone()),
            DispatcherConfig::default(),
        );
        dispatcher
            .initialize(vec![HandlerConfig::new(
                HandlerSettings::new("a.proto").with_service("bc"),
                EchoHandler,
            )])
            .unwrap();

        let err = dispatcher.start().await.unwrap_err();
        assert!(err.is_not_registered());
        assert_eq!(bus.subscriber_count("ab.c.Echo"), 0);
    }

    #[tokio::test]
    async fn failed_start_stops_sessions_already_started() {
        let bus = InMemoryBus::new();
        let registry = ServiceRegistry::new();
        registry.register(echo_service("echo", "A"));
        let dispatcher = dispatcher(
            &bus,
            registry,
            DispatcherConfig::default(),
            vec![echo_handler(Some("A")), echo_handler(Some("B"))],
        );

        let err = dispatcher.start().await.unwrap_err();
        assert!(err.is_not_registered());
        assert!(dispatcher
            .sessions()
            .iter()
            .all(|s| s.state() == SessionState::Closed));
        assert_eq!(bus.subscriber_count("echo.A.Echo"), 0);
    }

    #[tokio::test]
    async fn start_then_stop_closes_every_session() {
        let bus = InMemoryBus::new();
        let registry = ServiceRegistry::new();
        registry.register(echo_service("echo", "EchoService"));
        let dispatcher = dispatcher(
            &bus,
            registry,
            DispatcherConfig::default(),
            vec![echo_handler(Some("EchoService")), echo_handler(Some("EchoService"))],
        );

        dispatcher.start().await.unwrap();
        assert_eq!(bus.connect_count(), 2);
        assert!(dispatcher
            .sessions()
            .iter()
            .all(|s| s.state() == SessionState::Running));
        // both sessions share the queue group
        assert_eq!(bus.subscriber_count("echo.EchoService.Echo"), 2);

        dispatcher.stop().await.unwrap();
        dispatcher.stop().await.unwrap();
        assert!(dispatcher
            .sessions()
            .iter()
            .all(|s| s.state() == SessionState::Closed));
    }
}
