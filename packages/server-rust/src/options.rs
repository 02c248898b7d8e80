//! Translation of `ConnectionSettings` into validated connect-time options.
//!
//! Pure configuration translation: nothing here opens files or sockets, so
//! every rule can be checked without a live bus. File paths are carried as
//! paths and only read by the transport when it connects.

use std::path::PathBuf;
use std::time::Duration;

use busrpc_core::ConnectionSettings;

use crate::error::ConfigError;

// ---------------------------------------------------------------------------
// Option types
// ---------------------------------------------------------------------------

/// How the connection authenticates. At most one mechanism applies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOptions {
    None,
    UserPassword { username: String, password: String },
    Token(String),
    /// Path to a file holding an nkey seed.
    NkeySeedFile(PathBuf),
    /// Path to a chained JWT + nkey credentials file.
    CredentialsFile(PathBuf),
}

/// Reconnect behaviour. `None` fields leave the client's default in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectOptions {
    /// Never reconnect after the connection is lost.
    Disabled,
    Enabled {
        max_attempts: Option<u32>,
        /// Try servers in configured order rather than shuffled.
        dont_randomize: bool,
        wait: Option<Duration>,
        buffer_size: Option<usize>,
    },
}

impl ReconnectOptions {
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        matches!(self, Self::Disabled)
    }
}

/// Mutual-TLS configuration. Only present when a client certificate is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsOptions {
    pub ca_file: PathBuf,
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    /// Disables server certificate validation. Explicit opt-in only.
    pub skip_verify: bool,
}

/// Validated connect-time options consumed by a `BusConnector`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub servers: Vec<String>,
    pub name: Option<String>,
    pub auth: AuthOptions,
    pub reconnect: ReconnectOptions,
    pub tls: Option<TlsOptions>,
}

impl ConnectOptions {
    /// Comma-joined server list, for logs and error messages.
    #[must_use]
    pub fn servers_display(&self) -> String {
        self.servers.join(",")
    }
}

// ---------------------------------------------------------------------------
// ConnectionOptionBuilder
// ---------------------------------------------------------------------------

/// Builds `ConnectOptions` from settings. Stateless.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectionOptionBuilder;

impl ConnectionOptionBuilder {
    /// Validates `settings` and translates them into connect options.
    ///
    /// # Errors
    ///
    /// - `MissingClusterUrls` if no server address is configured.
    /// - `MissingPassword` if a username is set without a password.
    /// - `MissingKeyFile` / `MissingCertFile` if only half of a client
    ///   certificate pair is set.
    /// - `MissingCaFile` if a client certificate is set without a CA file.
    pub fn build(settings: &ConnectionSettings) -> Result<ConnectOptions, ConfigError> {
        if settings.cluster_urls.is_empty() {
            return Err(ConfigError::MissingClusterUrls);
        }

        Ok(ConnectOptions {
            servers: settings.cluster_urls.clone(),
            name: settings.connection_name.clone(),
            auth: Self::auth(settings)?,
            reconnect: Self::reconnect(settings)?,
            tls: Self::tls(settings)?,
        })
    }

    fn auth(settings: &ConnectionSettings) -> Result<AuthOptions, ConfigError> {
        if let Some(username) = &settings.username {
            let password = settings
                .password
                .as_ref()
                .ok_or(ConfigError::MissingPassword)?;
            return Ok(AuthOptions::UserPassword {
                username: username.clone(),
                password: password.clone(),
            });
        }
        if let Some(token) = &settings.token {
            return Ok(AuthOptions::Token(token.clone()));
        }
        if let Some(seed_file) = &settings.nkey_seed_file {
            return Ok(AuthOptions::NkeySeedFile(PathBuf::from(seed_file)));
        }
        if let Some(creds) = &settings.credentials_file {
            return Ok(AuthOptions::CredentialsFile(PathBuf::from(creds)));
        }
        Ok(AuthOptions::None)
    }

    fn reconnect(settings: &ConnectionSettings) -> Result<ReconnectOptions, ConfigError> {
        if !settings.auto_reconnect {
            return Ok(ReconnectOptions::Disabled);
        }

        let max_attempts = positive(settings.max_reconnects, "maxReconnects")?;
        let wait = positive(settings.reconnect_wait, "reconnectWait")?.map(Duration::from_secs);
        let buffer_size = positive(settings.reconnect_buffer_size, "reconnectBufferSize")?;

        Ok(ReconnectOptions::Enabled {
            max_attempts,
            dont_randomize: settings.enable_random_reconnection,
            wait,
            buffer_size,
        })
    }

    fn tls(settings: &ConnectionSettings) -> Result<Option<TlsOptions>, ConfigError> {
        let (cert_file, key_file) = match (&settings.cert_file, &settings.key_file) {
            (None, None) => return Ok(None),
            (Some(_), None) => return Err(ConfigError::MissingKeyFile),
            (None, Some(_)) => return Err(ConfigError::MissingCertFile),
            (Some(cert), Some(key)) => (cert, key),
        };
        let ca_file = settings.ca_file.as_ref().ok_or(ConfigError::MissingCaFile)?;

        Ok(Some(TlsOptions {
            ca_file: PathBuf::from(ca_file),
            cert_file: PathBuf::from(cert_file),
            key_file: PathBuf::from(key_file),
            skip_verify: settings.skip_verify,
        }))
    }
}

/// `Some(value)` when `value > 0`, `None` for zero or negative values.
/// Values too large for the target type are rejected rather than truncated.
fn positive<T: TryFrom<i64>>(value: i64, field: &str) -> Result<Option<T>, ConfigError> {
    if value <= 0 {
        return Ok(None);
    }
    T::try_from(value)
        .map(Some)
        .map_err(|_| ConfigError::InvalidSettings(format!("{field} out of range: {value}")))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn base() -> ConnectionSettings {
        ConnectionSettings::with_urls(["nats://localhost:4222"])
    }

    #[test]
    fn defaults_are_unauthenticated_without_tls() {
        let opts = ConnectionOptionBuilder::build(&base()).unwrap();
        assert_eq!(opts.servers, vec!["nats://localhost:4222"]);
        assert_eq!(opts.auth, AuthOptions::None);
        assert!(opts.tls.is_none());
        assert!(opts.name.is_none());
    }

    #[test]
    fn empty_cluster_urls_rejected() {
        let err = ConnectionOptionBuilder::build(&ConnectionSettings::default()).unwrap_err();
        assert_eq!(err, ConfigError::MissingClusterUrls);
    }

    #[test]
    fn username_without_password_fails() {
        let settings = ConnectionSettings {
            username: Some("alice".into()),
            ..base()
        };
        let err = ConnectionOptionBuilder::build(&settings).unwrap_err();
        assert_eq!(err, ConfigError::MissingPassword);
    }

    #[test]
    fn first_auth_mechanism_wins() {
        let settings = ConnectionSettings {
            username: Some("alice".into()),
            password: Some("secret".into()),
            token: Some("tok".into()),
            credentials_file: Some("/etc/creds".into()),
            ..base()
        };
        let opts = ConnectionOptionBuilder::build(&settings).unwrap();
        assert_eq!(
            opts.auth,
            AuthOptions::UserPassword {
                username: "alice".into(),
                password: "secret".into(),
            }
        );

        let settings = ConnectionSettings {
            token: Some("tok".into()),
            nkey_seed_file: Some("/etc/seed".into()),
            ..base()
        };
        let opts = ConnectionOptionBuilder::build(&settings).unwrap();
        assert_eq!(opts.auth, AuthOptions::Token("tok".into()));

        let settings = ConnectionSettings {
            nkey_seed_file: Some("/etc/seed".into()),
            credentials_file: Some("/etc/creds".into()),
            ..base()
        };
        let opts = ConnectionOptionBuilder::build(&settings).unwrap();
        assert_eq!(opts.auth, AuthOptions::NkeySeedFile("/etc/seed".into()));
    }

    #[test]
    fn disabled_reconnect_ignores_other_fields() {
        let settings = ConnectionSettings {
            auto_reconnect: false,
            max_reconnects: 10,
            enable_random_reconnection: true,
            reconnect_wait: 5,
            reconnect_buffer_size: 1024,
            ..base()
        };
        let opts = ConnectionOptionBuilder::build(&settings).unwrap();
        assert_eq!(opts.reconnect, ReconnectOptions::Disabled);
    }

    #[test]
    fn enabled_reconnect_applies_only_positive_fields() {
        let settings = ConnectionSettings {
            auto_reconnect: true,
            max_reconnects: 0,
            reconnect_wait: 3,
            reconnect_buffer_size: -1,
            ..base()
        };
        let opts = ConnectionOptionBuilder::build(&settings).unwrap();
        assert_eq!(
            opts.reconnect,
            ReconnectOptions::Enabled {
                max_attempts: None,
                dont_randomize: false,
                wait: Some(Duration::from_secs(3)),
                buffer_size: None,
            }
        );
    }

    #[test]
    fn cert_without_key_fails() {
        let settings = ConnectionSettings {
            cert_file: Some("/tls/cert.pem".into()),
            ..base()
        };
        assert_eq!(
            ConnectionOptionBuilder::build(&settings).unwrap_err(),
            ConfigError::MissingKeyFile
        );

        let settings = ConnectionSettings {
            key_file: Some("/tls/key.pem".into()),
            ca_file: Some("/tls/ca.pem".into()),
            ..base()
        };
        assert_eq!(
            ConnectionOptionBuilder::build(&settings).unwrap_err(),
            ConfigError::MissingCertFile
        );
    }

    #[test]
    fn cert_and_key_without_ca_fails() {
        let settings = ConnectionSettings {
            cert_file: Some("/tls/cert.pem".into()),
            key_file: Some("/tls/key.pem".into()),
            ..base()
        };
        assert_eq!(
            ConnectionOptionBuilder::build(&settings).unwrap_err(),
            ConfigError::MissingCaFile
        );
    }

    #[test]
    fn full_tls_with_skip_verify() {
        let settings = ConnectionSettings {
            cert_file: Some("/tls/cert.pem".into()),
            key_file: Some("/tls/key.pem".into()),
            ca_file: Some("/tls/ca.pem".into()),
            skip_verify: true,
            ..base()
        };
        let tls = ConnectionOptionBuilder::build(&settings).unwrap().tls.unwrap();
        assert_eq!(tls.ca_file, PathBuf::from("/tls/ca.pem"));
        assert!(tls.skip_verify);
    }

    #[test]
    fn skip_verify_alone_does_not_engage_tls() {
        let settings = ConnectionSettings {
            skip_verify: true,
            ..base()
        };
        assert!(ConnectionOptionBuilder::build(&settings).unwrap().tls.is_none());
    }

    proptest! {
        #[test]
        fn build_is_deterministic(
            auto_reconnect in any::<bool>(),
            max_reconnects in -5i64..50,
            reconnect_wait in -5i64..50,
            buffer in -5i64..100_000,
            dont_randomize in any::<bool>(),
            token in proptest::option::of("[a-z]{1,8}"),
        ) {
            let settings = ConnectionSettings {
                auto_reconnect,
                max_reconnects,
                reconnect_wait,
                reconnect_buffer_size: buffer,
                enable_random_reconnection: dont_randomize,
                token,
                ..base()
            };
            let first = ConnectionOptionBuilder::build(&settings);
            let second = ConnectionOptionBuilder::build(&settings);
            prop_assert_eq!(first, second);
        }

        #[test]
        fn disabled_reconnect_always_suppresses(
            max_reconnects in any::<i64>(),
            reconnect_wait in any::<i64>(),
            buffer in any::<i64>(),
        ) {
            let settings = ConnectionSettings {
                auto_reconnect: false,
                max_reconnects,
                reconnect_wait,
                reconnect_buffer_size: buffer,
                ..base()
            };
            let opts = ConnectionOptionBuilder::build(&settings).unwrap();
            prop_assert!(opts.reconnect.is_disabled());
        }
    }
}
