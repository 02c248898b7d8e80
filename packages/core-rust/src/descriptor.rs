use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies a service by protocol name and service name.
///
/// Immutable once constructed; used as the registry key. Equality and
/// hashing consider both parts separately, so `("ab", "c")` and `("a", "bc")`
/// are distinct even though their legacy concatenated keys are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDescriptor {
    protocol: String,
    service: String,
}

impl ServiceDescriptor {
    #[must_use]
    pub fn new(protocol: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            service: service.into(),
        }
    }

    #[must_use]
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Legacy registry key: protocol name immediately followed by service name.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}{}", self.protocol, self.service)
    }

    /// Whether this descriptor names `service` within `protocol`.
    #[must_use]
    pub fn matches(&self, protocol: &str, service: &str) -> bool {
        self.protocol == protocol && self.service == service
    }
}

impl fmt::Display for ServiceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.protocol, self.service)
    }
}
