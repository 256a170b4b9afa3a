//! Server error types.

use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] relay_protocol::ProtocolError),

    #[error("store error: {0}")]
    Store(#[from] relay_store::StoreError),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("invalid payload for {command}: {reason}")]
    InvalidPayload { command: String, reason: String },

    #[error("server shutting down")]
    ShuttingDown,
}

impl ServerError {
    /// Returns the text carried in an `error` envelope for this error.
    pub fn event_message(&self) -> String {
        match self {
            ServerError::InvalidPayload { .. } | ServerError::Store(_) => self.to_string(),
            _ => "internal error".to_string(),
        }
    }

    /// Returns the metrics label for this error.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerError::Io(_) => "io",
            ServerError::Protocol(_) => "protocol",
            ServerError::Store(_) => "store",
            ServerError::WebSocket(_) => "websocket",
            ServerError::InvalidPayload { .. } => "payload",
            ServerError::ShuttingDown => "shutdown",
        }
    }
}
