//! High-level client API.

use crate::connection::{Connection, ConnectionConfig};
use crate::error::ClientError;
use relay_protocol::{names, Envelope};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

/// High-level client for the relay.
pub struct Client {
    conn: Arc<Connection>,
}

impl Client {
    /// Creates a new client with the given configuration.
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            conn: Arc::new(Connection::new(config)),
        }
    }

    /// Creates a client and connects it to `url`.
    pub async fn connect_to(url: impl Into<String>) -> Result<Self, ClientError> {
        let client = Self::new(ConnectionConfig::new(url));
        client.connect().await?;
        Ok(client)
    }

    /// Connects to the server.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.conn.connect().await
    }

    /// Returns whether the client is connected.
    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    /// Closes the connection.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.conn.close().await
    }

    /// Returns the underlying connection.
    pub fn connection(&self) -> Arc<Connection> {
        self.conn.clone()
    }

    // =========================================================================
    // Sending
    // =========================================================================

    /// Sends an arbitrary command.
    pub async fn send(&self, name: &str, data: Value) -> Result<(), ClientError> {
        self.conn.send(&Envelope::new(name, data)).await
    }

    pub async fn add_room(&self, name: &str) -> Result<(), ClientError> {
        self.send(names::ROOM_ADD, json!({ "name": name })).await
    }

    pub async fn edit_user(&self, name: &str) -> Result<(), ClientError> {
        self.send(names::USER_EDIT, json!({ "name": name })).await
    }

    pub async fn add_message(&self, room_id: &str, body: &str) -> Result<(), ClientError> {
        self.send(
            names::MESSAGE_ADD,
            json!({ "roomId": room_id, "body": body }),
        )
        .await
    }

    pub async fn subscribe_rooms(&self) -> Result<(), ClientError> {
        self.send(names::ROOM_SUBSCRIBE, Value::Null).await
    }

    pub async fn unsubscribe_rooms(&self) -> Result<(), ClientError> {
        self.send(names::ROOM_UNSUBSCRIBE, Value::Null).await
    }

    pub async fn subscribe_users(&self) -> Result<(), ClientError> {
        self.send(names::USER_SUBSCRIBE, Value::Null).await
    }

    pub async fn unsubscribe_users(&self) -> Result<(), ClientError> {
        self.send(names::USER_UNSUBSCRIBE, Value::Null).await
    }

    pub async fn subscribe_messages(&self, room_id: &str) -> Result<(), ClientError> {
        self.send(names::MESSAGE_SUBSCRIBE, json!({ "roomId": room_id }))
            .await
    }

    pub async fn unsubscribe_messages(&self) -> Result<(), ClientError> {
        self.send(names::MESSAGE_UNSUBSCRIBE, Value::Null).await
    }

    // =========================================================================
    // Receiving
    // =========================================================================

    /// Waits for the next event using the configured timeout.
    pub async fn recv(&self) -> Result<Envelope, ClientError> {
        self.conn.recv_timeout(self.conn.config().recv_timeout).await
    }

    /// Waits up to `timeout` for the next event.
    pub async fn recv_timeout(&self, timeout: Duration) -> Result<Envelope, ClientError> {
        self.conn.recv_timeout(timeout).await
    }

    /// Waits for the next event named `name`, discarding others. An `error`
    /// event fails the wait unless `name` is `error`.
    pub async fn recv_named(&self, name: &str) -> Result<Envelope, ClientError> {
        let deadline = tokio::time::Instant::now() + self.conn.config().recv_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let envelope = self.conn.recv_timeout(remaining).await?;
            if envelope.name() == name {
                return Ok(envelope);
            }
            if let Some(message) = envelope.error_message() {
                return Err(ClientError::Server(message.to_string()));
            }
            tracing::debug!("Skipping '{}' while waiting for '{}'", envelope.name(), name);
        }
    }

    /// Returns the next event if one arrives within `window`, `None` if the
    /// connection stays quiet.
    pub async fn recv_within(&self, window: Duration) -> Result<Option<Envelope>, ClientError> {
        match self.conn.recv_timeout(window).await {
            Ok(envelope) => Ok(Some(envelope)),
            Err(ClientError::Timeout) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
