//! Connection management.

use crate::error::ClientError;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use relay_protocol::{Decoder, Encoder, Envelope, DEFAULT_PORT};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Default capacity of the received event channel.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Server URL, e.g. `ws://127.0.0.1:4000`.
    pub url: String,
    /// Connection and upgrade timeout.
    pub connect_timeout: Duration,
    /// Default timeout when waiting for an event.
    pub recv_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::new(format!("ws://127.0.0.1:{}", DEFAULT_PORT))
    }
}

impl ConnectionConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: Duration::from_secs(10),
            recv_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_recv_timeout(mut self, timeout: Duration) -> Self {
        self.recv_timeout = timeout;
        self
    }
}

/// A WebSocket connection to a relay server.
///
/// A background task decodes incoming messages into a channel read by
/// `recv`; sends go straight to the socket.
pub struct Connection {
    config: ConnectionConfig,
    writer: Mutex<Option<SplitSink<WsStream, Message>>>,
    events: Mutex<Option<mpsc::Receiver<Envelope>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    connected: Arc<AtomicBool>,
}

impl Connection {
    /// Creates a new connection (not yet connected).
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            writer: Mutex::new(None),
            events: Mutex::new(None),
            reader: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Connects and performs the WebSocket upgrade.
    pub async fn connect(&self) -> Result<(), ClientError> {
        tracing::debug!("Connecting to {}...", self.config.url);

        let (socket, _response) = tokio::time::timeout(
            self.config.connect_timeout,
            tokio_tungstenite::connect_async_with_config(self.config.url.as_str(), None, true),
        )
        .await
        .map_err(|_| ClientError::Timeout)??;

        let (sink, stream) = socket.split();
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let connected = self.connected.clone();
        connected.store(true, Ordering::SeqCst);

        let task = tokio::spawn(read_loop(stream, tx, connected));

        *self.writer.lock().await = Some(sink);
        *self.events.lock().await = Some(rx);
        if let Some(previous) = self.reader.lock().await.replace(task) {
            previous.abort();
        }

        tracing::debug!("Connected to {}", self.config.url);
        Ok(())
    }

    /// Returns whether the connection is open.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Sends an envelope.
    pub async fn send(&self, envelope: &Envelope) -> Result<(), ClientError> {
        let text = Encoder::encode(envelope)?;
        let mut writer = self.writer.lock().await;
        let sink = writer.as_mut().ok_or(ClientError::NotConnected)?;
        tracing::debug!("Sending '{}'", envelope.name());
        sink.send(Message::Text(text)).await?;
        Ok(())
    }

    /// Sends raw text, bypassing envelope encoding.
    pub async fn send_raw(&self, text: impl Into<String>) -> Result<(), ClientError> {
        let mut writer = self.writer.lock().await;
        let sink = writer.as_mut().ok_or(ClientError::NotConnected)?;
        sink.send(Message::Text(text.into())).await?;
        Ok(())
    }

    /// Waits up to `timeout` for the next event.
    pub async fn recv_timeout(&self, timeout: Duration) -> Result<Envelope, ClientError> {
        let mut events = self.events.lock().await;
        let rx = events.as_mut().ok_or(ClientError::NotConnected)?;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(envelope)) => Ok(envelope),
            Ok(None) => Err(ClientError::ConnectionClosed),
            Err(_) => Err(ClientError::Timeout),
        }
    }

    /// Closes the connection with a normal close frame.
    pub async fn close(&self) -> Result<(), ClientError> {
        if let Some(mut sink) = self.writer.lock().await.take() {
            // The peer may already be gone
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
        }
        if let Some(task) = self.reader.lock().await.take() {
            task.abort();
        }
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

async fn read_loop(
    mut stream: SplitStream<WsStream>,
    tx: mpsc::Sender<Envelope>,
    connected: Arc<AtomicBool>,
) {
    while let Some(message) = stream.next().await {
        let decoded = match message {
            Ok(Message::Text(text)) => Decoder::decode(&text),
            Ok(Message::Binary(bytes)) => Decoder::decode_bytes(&bytes),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!("Read error: {}", e);
                break;
            }
        };

        match decoded {
            Ok(envelope) => {
                if tx.send(envelope).await.is_err() {
                    break;
                }
            }
            Err(e) => tracing::warn!("Dropping undecodable message: {}", e),
        }
    }

    connected.store(false, Ordering::SeqCst);
    tracing::debug!("Connection closed by server");
}
