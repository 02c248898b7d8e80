//! Error taxonomy for the bridge.
//!
//! Configuration, connection, and registration errors are fatal at dispatcher
//! start. Call errors are what a waiting caller observes.

/// Invalid connection settings. Detected while building connect options,
/// before any network I/O.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("missing password")]
    MissingPassword,
    #[error("missing caFile")]
    MissingCaFile,
    #[error("missing certFile")]
    MissingCertFile,
    #[error("missing keyFile")]
    MissingKeyFile,
    #[error("missing clusterUrls")]
    MissingClusterUrls,
    #[error("invalid settings: {0}")]
    InvalidSettings(String),
}

/// Failure to open or use a bus connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("bus unreachable at {servers}: {reason}")]
    Unreachable { servers: String, reason: String },
    #[error("connection closed")]
    Closed,
    #[error("no responders for subject {subject}")]
    NoResponders { subject: String },
    #[error("request on {subject} timed out")]
    RequestTimeout { subject: String },
    #[error("bus operation failed: {0}")]
    Transport(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// No service implementation could be wired to a session.
#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error("no server services registered")]
    NoServices,
    #[error("protocol [{protocol}] and service [{service}] not registered")]
    NotRegistered { protocol: String, service: String },
    #[error("failed to subscribe to {subject}: {reason}")]
    Subscribe { subject: String, reason: String },
    #[error("service {service} failed to register: {source}")]
    Service {
        service: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Outcome of a call that produced no reply.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    #[error("call timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("session closed before the call completed")]
    SessionClosed,
    #[error("session is not running")]
    NotRunning,
}

/// Failure of a client-side call made through `RpcClient`.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("failed to encode request: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode reply: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Errors surfaced by dispatcher and session lifecycle calls.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Registration(#[from] RegistrationError),
    #[error("dispatcher already initialized")]
    AlreadyInitialized,
    #[error("dispatcher already started")]
    AlreadyStarted,
    #[error("session {session} is {state}, expected {expected}")]
    InvalidState {
        session: String,
        state: &'static str,
        expected: &'static str,
    },
}

impl DispatchError {
    /// Whether this is a "not registered" class error.
    #[must_use]
    pub fn is_not_registered(&self) -> bool {
        matches!(
            self,
            Self::Registration(RegistrationError::NoServices | RegistrationError::NotRegistered { .. })
        )
    }
}
