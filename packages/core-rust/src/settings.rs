//! Connection and handler settings as they arrive from trigger configuration.
//!
//! Field names follow the `camelCase` keys of the trigger configuration
//! document. The older `nats`-prefixed keys are accepted as aliases so
//! existing configuration files keep working.

use serde::{Deserialize, Deserializer, Serialize};

/// Errors produced while decoding a settings document.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("invalid trigger config: {0}")]
    Json(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Deserialization helpers
// ---------------------------------------------------------------------------

/// Treats an empty string the same as an absent field.
fn non_empty<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<String>::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.trim().is_empty()))
}

/// Accepts either a JSON array of URLs or a single comma-separated string.
fn url_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Urls {
        Joined(String),
        List(Vec<String>),
    }

    let urls = match Urls::deserialize(deserializer)? {
        Urls::Joined(joined) => joined.split(',').map(str::to_string).collect(),
        Urls::List(list) => list,
    };
    Ok(urls
        .into_iter()
        .map(|u| u.trim().to_string())
        .filter(|u| !u.is_empty())
        .collect())
}

// ---------------------------------------------------------------------------
// ConnectionSettings
// ---------------------------------------------------------------------------

/// Connect-time settings for one bus connection.
///
/// Auth fields are mutually exclusive; the option builder picks the first one
/// set in the order username, token, nkey seed file, credentials file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSettings {
    #[serde(alias = "natsClusterUrls", deserialize_with = "url_list")]
    pub cluster_urls: Vec<String>,
    #[serde(default, alias = "natsConnName", deserialize_with = "non_empty")]
    pub connection_name: Option<String>,

    #[serde(default, rename = "userName", alias = "natsUserName", deserialize_with = "non_empty")]
    pub username: Option<String>,
    #[serde(default, rename = "userPassword", alias = "natsUserPassword", deserialize_with = "non_empty")]
    pub password: Option<String>,
    #[serde(default, alias = "natsToken", deserialize_with = "non_empty")]
    pub token: Option<String>,
    #[serde(default, alias = "natsNkeySeedfile", deserialize_with = "non_empty")]
    pub nkey_seed_file: Option<String>,
    #[serde(default, alias = "natsCredentialFile", deserialize_with = "non_empty")]
    pub credentials_file: Option<String>,

    #[serde(default)]
    pub auto_reconnect: bool,
    #[serde(default)]
    pub max_reconnects: i64,
    /// When set, the server list is tried in configured order instead of
    /// being shuffled. The name is kept for configuration compatibility.
    #[serde(default)]
    pub enable_random_reconnection: bool,
    /// Wait between reconnect attempts, in whole seconds.
    #[serde(default)]
    pub reconnect_wait: i64,
    /// Bytes buffered for outbound traffic while reconnecting.
    #[serde(default)]
    pub reconnect_buffer_size: i64,

    #[serde(default)]
    pub skip_verify: bool,
    #[serde(default, deserialize_with = "non_empty")]
    pub ca_file: Option<String>,
    #[serde(default, deserialize_with = "non_empty")]
    pub cert_file: Option<String>,
    #[serde(default, deserialize_with = "non_empty")]
    pub key_file: Option<String>,
}

impl ConnectionSettings {
    /// Settings for an unauthenticated, non-reconnecting connection to `urls`.
    #[must_use]
    pub fn with_urls<I, S>(urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            cluster_urls: urls.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// HandlerSettings
// ---------------------------------------------------------------------------

/// Per-handler settings: which protocol (and optionally which service) a
/// session serves.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandlerSettings {
    pub proto_name: String,
    #[serde(default, deserialize_with = "non_empty")]
    pub service_name: Option<String>,
    #[serde(default, deserialize_with = "non_empty")]
    pub proto_file: Option<String>,
}

impl HandlerSettings {
    #[must_use]
    pub fn new(proto_name: impl Into<String>) -> Self {
        Self {
            proto_name: proto_name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_service(mut self, service_name: impl Into<String>) -> Self {
        self.service_name = Some(service_name.into());
        self
    }

    /// Protocol name with any file suffix removed (`echo.proto` -> `echo`).
    #[must_use]
    pub fn protocol(&self) -> &str {
        self.proto_name
            .split('.')
            .next()
            .unwrap_or(&self.proto_name)
    }
}

// ---------------------------------------------------------------------------
// TriggerConfig
// ---------------------------------------------------------------------------

/// One handler entry of a trigger configuration document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerConfigDoc {
    pub settings: HandlerSettings,
}

/// Complete trigger configuration: shared connection settings plus one
/// entry per handler (one session each).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerConfig {
    #[serde(default)]
    pub id: String,
    pub settings: ConnectionSettings,
    #[serde(default)]
    pub handlers: Vec<HandlerConfigDoc>,
}

impl TriggerConfig {
    /// Parses a trigger configuration from its JSON form.
    ///
    /// # Errors
    ///
    /// Returns `SettingsError::Json` if the document is malformed or a
    /// required field (`settings.clusterUrls`) is missing.
    pub fn from_json(json: &str) -> Result<Self, SettingsError> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRIGGER_JSON: &str = r#"{
        "id": "nrpc-trigger",
        "settings": {
            "natsClusterUrls": "nats://localhost:4222, nats://localhost:4223",
            "natsUserName": "",
            "autoReconnect": true,
            "reconnectWait": 2
        },
        "handlers": [
            {
                "action": { "id": "dummy" },
                "settings": {
                    "protoName": "echo.proto",
                    "serviceName": "EchoService",
                    "port": 50051
                }
            }
        ]
    }"#;

    #[test]
    fn parses_trigger_document_with_legacy_keys() {
        let config = TriggerConfig::from_json(TRIGGER_JSON).unwrap();
        assert_eq!(config.id, "nrpc-trigger");
        assert_eq!(
            config.settings.cluster_urls,
            vec!["nats://localhost:4222", "nats://localhost:4223"]
        );
        assert!(config.settings.username.is_none(), "empty string is absent");
        assert!(config.settings.auto_reconnect);
        assert_eq!(config.settings.reconnect_wait, 2);
        assert_eq!(config.handlers.len(), 1);
        assert_eq!(config.handlers[0].settings.protocol(), "echo");
        assert_eq!(
            config.handlers[0].settings.service_name.as_deref(),
            Some("EchoService")
        );
    }

    #[test]
    fn cluster_urls_accepts_array() {
        let settings: ConnectionSettings = serde_json::from_value(serde_json::json!({
            "clusterUrls": ["nats://a:4222", " ", "nats://b:4222"],
            "caFile": "/etc/ca.pem"
        }))
        .unwrap();
        assert_eq!(settings.cluster_urls, vec!["nats://a:4222", "nats://b:4222"]);
        assert_eq!(settings.ca_file.as_deref(), Some("/etc/ca.pem"));
        assert!(!settings.auto_reconnect);
    }

    #[test]
    fn missing_cluster_urls_is_rejected() {
        let err = TriggerConfig::from_json(r#"{"settings": {}}"#).unwrap_err();
        assert!(err.to_string().contains("clusterUrls"));
    }

    #[test]
    fn protocol_without_suffix_is_unchanged() {
        assert_eq!(HandlerSettings::new("echo").protocol(), "echo");
        assert_eq!(HandlerSettings::new("a.b.proto").protocol(), "a");
    }
}
