//! Client error types.

use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("protocol error: {0}")]
    Protocol(#[from] relay_protocol::ProtocolError),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("timed out")]
    Timeout,

    #[error("server error: {0}")]
    Server(String),
}

impl ClientError {
    /// Returns whether reconnecting may help.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::WebSocket(_) | ClientError::ConnectionClosed | ClientError::Timeout
        )
    }
}
