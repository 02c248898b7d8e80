//! NATS transport over the `async-nats` client.
//!
//! Maps validated `ConnectOptions` onto the client's builder. A few options
//! have no client equivalent and are handled as follows:
//!
//! - disabled reconnect becomes a single connection attempt
//! - `dont_randomize` and `buffer_size` are logged and ignored
//! - `skip_verify` is rejected as invalid settings
//!
//! `drain` only flushes buffered publishes. Subscriptions are not drained
//! server-side; they end when the session stop signal fires and the client
//! is closed.

use std::sync::Arc;
use std::time::Duration;

use async_nats::RequestErrorKind;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{BusConnection, BusConnector, BusMessage, Subscription};
use crate::error::{ConfigError, ConnectionError};
use crate::options::{AuthOptions, ConnectOptions, ReconnectOptions};

// ---------------------------------------------------------------------------
// NatsConnector
// ---------------------------------------------------------------------------

/// Opens connections to a NATS cluster.
#[derive(Debug, Clone, Copy, Default)]
pub struct NatsConnector;

impl NatsConnector {
    async fn client_options(
        options: &ConnectOptions,
    ) -> Result<async_nats::ConnectOptions, ConnectionError> {
        let mut builder = async_nats::ConnectOptions::new();
        if let Some(name) = &options.name {
            builder = builder.name(name.as_str());
        }

        builder = match &options.auth {
            AuthOptions::None => builder,
            AuthOptions::UserPassword { username, password } => {
                builder.user_and_password(username.clone(), password.clone())
            }
            AuthOptions::Token(token) => builder.token(token.clone()),
            AuthOptions::NkeySeedFile(path) => {
                let seed = tokio::fs::read_to_string(path).await?;
                builder.nkey(seed.trim().to_string())
            }
            AuthOptions::CredentialsFile(path) => builder.credentials_file(path).await?,
        };

        builder = match &options.reconnect {
            ReconnectOptions::Disabled => builder.max_reconnects(Some(1)),
            ReconnectOptions::Enabled {
                max_attempts,
                dont_randomize,
                wait,
                buffer_size,
            } => {
                if *dont_randomize {
                    debug!("server order randomization setting ignored by this transport");
                }
                if let Some(size) = buffer_size {
                    debug!(size, "reconnect buffer size ignored by this transport");
                }
                let mut builder = match max_attempts {
                    Some(attempts) => builder
                        .max_reconnects(Some(usize::try_from(*attempts).unwrap_or(usize::MAX))),
                    None => builder,
                };
                if let Some(wait) = *wait {
                    builder = builder.reconnect_delay_callback(move |_attempt| wait);
                }
                builder
            }
        };

        if let Some(tls) = &options.tls {
            if tls.skip_verify {
                return Err(ConfigError::InvalidSettings(
                    "skipVerify is not supported by the NATS transport".to_string(),
                )
                .into());
            }
            builder = builder
                .require_tls(true)
                .add_root_certificates(tls.ca_file.clone())
                .add_client_certificate(tls.cert_file.clone(), tls.key_file.clone());
        }

        Ok(builder)
    }
}

#[async_trait]
impl BusConnector for NatsConnector {
    async fn connect(
        &self,
        options: &ConnectOptions,
    ) -> Result<Arc<dyn BusConnection>, ConnectionError> {
        let servers = options.servers_display();
        let client_options = Self::client_options(options).await?;

        info!(%servers, "getting NATS connection");
        let client = client_options
            .connect(servers.as_str())
            .await
            .map_err(|err| ConnectionError::Unreachable {
                servers: servers.clone(),
                reason: err.to_string(),
            })?;
        info!(%servers, "got NATS connection");

        Ok(Arc::new(NatsConnection {
            client: Mutex::new(Some(client)),
        }))
    }
}

// ---------------------------------------------------------------------------
// NatsConnection
// ---------------------------------------------------------------------------

/// An open NATS client. Closing drops the client.
#[derive(Debug)]
pub struct NatsConnection {
    client: Mutex<Option<async_nats::Client>>,
}

impl NatsConnection {
    fn client(&self) -> Result<async_nats::Client, ConnectionError> {
        self.client.lock().clone().ok_or(ConnectionError::Closed)
    }
}

fn transport(err: impl std::fmt::Display) -> ConnectionError {
    ConnectionError::Transport(err.to_string())
}

#[async_trait]
impl BusConnection for NatsConnection {
    async fn subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
    ) -> Result<Subscription, ConnectionError> {
        let client = self.client()?;
        let subscriber = match queue_group {
            Some(group) => client
                .queue_subscribe(subject.to_string(), group.to_string())
                .await
                .map_err(transport)?,
            None => client
                .subscribe(subject.to_string())
                .await
                .map_err(transport)?,
        };
        let messages = subscriber
            .map(|message| BusMessage {
                subject: message.subject.to_string(),
                reply: message.reply.map(|reply| reply.to_string()),
                payload: message.payload,
            })
            .boxed();
        Ok(Subscription::new(subject, messages))
    }

    async fn publish(
        &self,
        subject: &str,
        reply: Option<&str>,
        payload: Bytes,
    ) -> Result<(), ConnectionError> {
        let client = self.client()?;
        match reply {
            Some(reply) => client
                .publish_with_reply(subject.to_string(), reply.to_string(), payload)
                .await
                .map_err(transport),
            None => client
                .publish(subject.to_string(), payload)
                .await
                .map_err(transport),
        }
    }

    async fn request(
        &self,
        subject: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<BusMessage, ConnectionError> {
        let client = self.client()?;
        let response = tokio::time::timeout(timeout, client.request(subject.to_string(), payload))
            .await
            .map_err(|_| ConnectionError::RequestTimeout {
                subject: subject.to_string(),
            })?;
        match response {
            Ok(message) => Ok(BusMessage {
                subject: message.subject.to_string(),
                reply: message.reply.map(|reply| reply.to_string()),
                payload: message.payload,
            }),
            Err(err) => Err(match err.kind() {
                RequestErrorKind::NoResponders => ConnectionError::NoResponders {
                    subject: subject.to_string(),
                },
                RequestErrorKind::TimedOut => ConnectionError::RequestTimeout {
                    subject: subject.to_string(),
                },
                _ => transport(err),
            }),
        }
    }

    async fn drain(&self) -> Result<(), ConnectionError> {
        self.client()?.flush().await.map_err(transport)
    }

    async fn close(&self) -> Result<(), ConnectionError> {
        if self.client.lock().take().is_none() {
            warn!("NATS connection already closed");
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.client.lock().is_none()
    }
}
