//! Client-side helper for calling services served by the bridge.

use std::sync::Arc;
use std::time::Duration;

use busrpc_core::subject::method_subject;
use busrpc_core::{ConnectionSettings, Reply, ServiceDescriptor};
use bytes::Bytes;
use serde_json::Value;
use tracing::debug;

use crate::bus::{BusConnection, BusConnector};
use crate::error::{ClientError, ConnectionError};
use crate::options::ConnectionOptionBuilder;

/// Issues request/reply calls over a bus connection and decodes the
/// `{code, data}` reply.
#[derive(Clone)]
pub struct RpcClient {
    connection: Arc<dyn BusConnection>,
    timeout: Duration,
}

impl RpcClient {
    #[must_use]
    pub fn new(connection: Arc<dyn BusConnection>, timeout: Duration) -> Self {
        Self {
            connection,
            timeout,
        }
    }

    /// Opens a dedicated connection from `settings`.
    ///
    /// # Errors
    ///
    /// Returns `Connection` if the settings are invalid or the bus is
    /// unreachable.
    pub async fn connect(
        connector: &dyn BusConnector,
        settings: &ConnectionSettings,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        let options = ConnectionOptionBuilder::build(settings).map_err(ConnectionError::from)?;
        let connection = connector.connect(&options).await?;
        Ok(Self::new(connection, timeout))
    }

    /// Calls `method` of `descriptor` with `payload`.
    ///
    /// # Errors
    ///
    /// - `Encode` if `payload` cannot be serialized.
    /// - `Connection` on no responders, timeout, or a closed connection.
    /// - `Decode` if the reply is not `{code, data}` JSON.
    pub async fn call(
        &self,
        descriptor: &ServiceDescriptor,
        method: &str,
        payload: &Value,
    ) -> Result<Reply, ClientError> {
        let subject = method_subject(descriptor, method);
        let body = serde_json::to_vec(payload).map_err(ClientError::Encode)?;
        debug!(%subject, bytes = body.len(), "sending request");

        let message = self
            .connection
            .request(&subject, Bytes::from(body), self.timeout)
            .await?;
        Reply::from_slice(&message.payload).map_err(ClientError::Decode)
    }

    /// Closes the underlying connection.
    ///
    /// # Errors
    ///
    /// Returns `Connection` if the transport fails to close.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.connection.close().await?;
        Ok(())
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
