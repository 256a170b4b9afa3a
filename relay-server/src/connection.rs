//! Connection actor.
//!
//! Each accepted socket gets one `Connection`. A read loop decodes envelopes
//! and dispatches them to handlers; a write loop drains the outbound queue
//! into the socket. Either loop ending tears the connection down.

use crate::error::ServerError;
use crate::feed::{self, Topic};
use crate::metrics::Metrics;
use crate::registry::{Slot, SubscriptionRegistry};
use crate::router::CommandRouter;
use crate::tables;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::RwLock;
use relay_protocol::{Decoder, Encoder, Envelope, User};
use relay_store::{Query, Store, StoreError};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Display name a connection starts with.
pub const ANONYMOUS: &str = "anonymous";

/// Sending half of a connection's outbound queue.
///
/// Clones share the same queue. After `close`, sends are dropped and
/// report `false`.
#[derive(Clone)]
pub struct OutboundQueue {
    tx: Arc<RwLock<Option<mpsc::Sender<Envelope>>>>,
}

impl OutboundQueue {
    /// Creates a bounded queue and its receiving half.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx: Arc::new(RwLock::new(Some(tx))),
            },
            rx,
        )
    }

    /// Queues an envelope, waiting while the queue is full.
    ///
    /// Returns false if the queue is closed or its receiver is gone.
    pub async fn send(&self, envelope: Envelope) -> bool {
        let tx = self.tx.read().clone();
        let Some(tx) = tx else {
            return false;
        };
        tx.send(envelope).await.is_ok()
    }

    /// Closes the queue. The receiver drains what is already queued.
    pub fn close(&self) {
        self.tx.write().take();
    }

    pub fn is_closed(&self) -> bool {
        self.tx.read().as_ref().map_or(true, |tx| tx.is_closed())
    }
}

/// Shared state every connection is built from.
#[derive(Clone)]
pub struct ConnectionContext {
    pub store: Arc<Store>,
    pub router: Arc<CommandRouter>,
    pub metrics: Option<Arc<Metrics>>,
    pub outbound_capacity: usize,
}

impl ConnectionContext {
    pub fn new(store: Arc<Store>, router: Arc<CommandRouter>) -> Self {
        Self {
            store,
            router,
            metrics: None,
            outbound_capacity: 256,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_outbound_capacity(mut self, capacity: usize) -> Self {
        self.outbound_capacity = capacity;
        self
    }
}

/// One client connection.
pub struct Connection {
    /// Id of this connection's `user` record.
    id: String,
    remote_addr: Option<SocketAddr>,
    name: RwLock<String>,
    outbound: OutboundQueue,
    registry: Mutex<SubscriptionRegistry>,
    store: Arc<Store>,
    router: Arc<CommandRouter>,
    metrics: Option<Arc<Metrics>>,
    closed: AtomicBool,
    shutdown: CancellationToken,
    writes: TaskTracker,
}

impl Connection {
    /// Registers a new connection by inserting its `user` record.
    ///
    /// Returns the connection and the receiving half of its outbound queue,
    /// which `serve` drains into the socket.
    pub fn open(
        ctx: &ConnectionContext,
        remote_addr: Option<SocketAddr>,
    ) -> Result<(Arc<Self>, mpsc::Receiver<Envelope>), ServerError> {
        let id = ctx.store.insert_as(tables::USER, &User::named(ANONYMOUS))?;
        let (outbound, rx) = OutboundQueue::new(ctx.outbound_capacity);

        let conn = Arc::new(Self {
            id,
            remote_addr,
            name: RwLock::new(ANONYMOUS.to_string()),
            outbound,
            registry: Mutex::new(SubscriptionRegistry::new()),
            store: ctx.store.clone(),
            router: ctx.router.clone(),
            metrics: ctx.metrics.clone(),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            writes: TaskTracker::new(),
        });

        tracing::debug!("[{}] Opened connection as user {}", conn.peer(), conn.id);
        Ok((conn, rx))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Current display name.
    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.write() = name.into();
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn outbound(&self) -> &OutboundQueue {
        &self.outbound
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns whether `slot` holds a live subscription.
    pub async fn is_subscribed(&self, slot: Slot) -> bool {
        self.registry.lock().await.is_active(slot)
    }

    fn peer(&self) -> String {
        self.remote_addr
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| self.id.clone())
    }

    /// Runs the connection over an upgraded socket until either side ends,
    /// then tears it down.
    pub async fn serve<W>(self: Arc<Self>, socket: W, outbound_rx: mpsc::Receiver<Envelope>)
    where
        W: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Send + 'static,
    {
        let (sink, stream) = socket.split();
        let writer = tokio::spawn(self.clone().write_loop(sink, outbound_rx));

        self.read_loop(stream).await;
        self.teardown().await;

        if let Err(e) = writer.await {
            tracing::error!("[{}] Write loop failed: {}", self.peer(), e);
        }
    }

    /// Like `serve`, but also tears the connection down once `stop` is
    /// cancelled. Returns true if `stop` ended it.
    pub async fn serve_until<W>(
        self: Arc<Self>,
        socket: W,
        outbound_rx: mpsc::Receiver<Envelope>,
        stop: CancellationToken,
    ) -> bool
    where
        W: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Send + 'static,
    {
        let serve = self.clone().serve(socket, outbound_rx);
        tokio::pin!(serve);

        tokio::select! {
            _ = &mut serve => false,
            _ = stop.cancelled() => {
                // Keep polling `serve`: the read loop may hold the registry lock
                tokio::join!(self.teardown(), &mut serve);
                true
            }
        }
    }

    async fn read_loop<S>(&self, mut stream: S)
    where
        S: Stream<Item = Result<Message, WsError>> + Unpin,
    {
        loop {
            let message = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                message = stream.next() => message,
            };

            let decoded = match message {
                Some(Ok(Message::Text(text))) => Decoder::decode(&text),
                Some(Ok(Message::Binary(bytes))) => Decoder::decode_bytes(&bytes),
                Some(Ok(Message::Close(_))) | None => {
                    tracing::debug!("[{}] Connection closed by client", self.peer());
                    break;
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    tracing::debug!("[{}] Read error: {}", self.peer(), e);
                    break;
                }
            };

            match decoded {
                Ok(envelope) => self.dispatch(envelope).await,
                Err(e) => {
                    self.record_error(&ServerError::Protocol(e));
                    tracing::debug!("[{}] Undecodable message, closing", self.peer());
                    break;
                }
            }
        }
    }

    async fn write_loop<S>(self: Arc<Self>, mut sink: S, mut rx: mpsc::Receiver<Envelope>)
    where
        S: Sink<Message, Error = WsError> + Unpin,
    {
        while let Some(envelope) = rx.recv().await {
            let text = match Encoder::encode(&envelope) {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(
                        "[{}] Dropping unencodable '{}' event: {}",
                        self.peer(),
                        envelope.name(),
                        e
                    );
                    continue;
                }
            };

            tracing::debug!("[{}] Sending '{}'", self.peer(), envelope.name());
            if let Err(e) = sink.send(Message::Text(text)).await {
                tracing::debug!("[{}] Write error: {}", self.peer(), e);
                self.record_error(&ServerError::WebSocket(e));
                drop(rx);
                self.teardown().await;
                return;
            }
        }

        // Queue closed and drained
        let _ = sink.send(Message::Close(None)).await;
        let _ = sink.close().await;
    }

    /// Resolves and runs the handler for an envelope. Unknown names are
    /// ignored.
    pub async fn dispatch(&self, envelope: Envelope) {
        let (name, data) = envelope.into_parts();

        let Some(handler) = self.router.resolve(&name) else {
            tracing::debug!("[{}] Ignoring unknown command '{}'", self.peer(), name);
            if let Some(ref metrics) = self.metrics {
                metrics.commands_total.with_label_values(&["unknown"]).inc();
            }
            return;
        };

        tracing::debug!("[{}] Command: {}", self.peer(), name);
        let start = Instant::now();
        handler(self, data).await;

        if let Some(ref metrics) = self.metrics {
            metrics.commands_total.with_label_values(&[name.as_str()]).inc();
            metrics
                .command_duration
                .with_label_values(&[name.as_str()])
                .observe(start.elapsed().as_secs_f64());
        }
    }

    /// Starts (or replaces) the subscription for `topic`.
    pub async fn subscribe(&self, topic: Topic, query: Query) {
        let result = {
            let mut registry = self.registry.lock().await;
            let was_active = registry.is_active(topic.slot);
            let result = registry
                .start(topic.slot, |token| {
                    feed::spawn_forwarder(
                        topic,
                        query,
                        &self.store,
                        self.outbound.clone(),
                        self.metrics.clone(),
                        token,
                    )
                })
                .await;
            self.track_subscription(topic.slot, was_active, registry.is_active(topic.slot));
            result
        };

        match result {
            Ok(()) => tracing::debug!("[{}] Subscribed to {}", self.peer(), topic.slot),
            Err(e) => self.report_error(ServerError::Store(e)).await,
        }
    }

    /// Stops the subscription in `slot`, if any.
    pub async fn unsubscribe(&self, slot: Slot) {
        let stopped = self.registry.lock().await.stop(slot).await;
        if stopped {
            self.track_subscription(slot, true, false);
            tracing::debug!("[{}] Unsubscribed from {}", self.peer(), slot);
        }
    }

    fn track_subscription(&self, slot: Slot, was_active: bool, is_active: bool) {
        let Some(ref metrics) = self.metrics else {
            return;
        };
        let gauge = metrics.subscriptions_active.with_label_values(&[slot.as_str()]);
        match (was_active, is_active) {
            (false, true) => gauge.inc(),
            (true, false) => gauge.dec(),
            _ => {}
        }
    }

    /// Runs a store write in the background. A failure is reported to the
    /// client as an `error` event.
    pub fn spawn_write<F>(&self, command: &'static str, write: F)
    where
        F: FnOnce(&Store) -> Result<(), StoreError> + Send + 'static,
    {
        let store = self.store.clone();
        let outbound = self.outbound.clone();
        let metrics = self.metrics.clone();
        let peer = self.peer();

        self.writes.spawn(async move {
            if let Err(e) = write(&store) {
                let err = ServerError::Store(e);
                tracing::warn!("[{}] {} failed: {}", peer, command, err);
                if let Some(ref metrics) = metrics {
                    metrics.errors_total.with_label_values(&[err.kind()]).inc();
                }
                outbound.send(Envelope::error(err.event_message())).await;
            }
        });
    }

    /// Sends an `error` event for a recoverable failure.
    pub async fn report_error(&self, err: ServerError) {
        tracing::debug!("[{}] Reporting error: {}", self.peer(), err);
        self.record_error(&err);
        self.outbound.send(Envelope::error(err.event_message())).await;
    }

    fn record_error(&self, err: &ServerError) {
        if let Some(ref metrics) = self.metrics {
            metrics.errors_total.with_label_values(&[err.kind()]).inc();
        }
    }

    /// Waits for background writes spawned so far to finish.
    pub async fn wait_for_writes(&self) {
        self.writes.close();
        self.writes.wait().await;
        self.writes.reopen();
    }

    /// Releases everything the connection holds. Runs once; later calls
    /// return immediately.
    pub async fn teardown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let cancelled = self.registry.lock().await.close().await;
        for slot in cancelled {
            self.track_subscription(slot, true, false);
        }

        self.outbound.close();

        if let Err(e) = self.store.delete(tables::USER, &self.id) {
            tracing::warn!("[{}] Failed to remove user {}: {}", self.peer(), self.id, e);
        }

        self.shutdown.cancel();
        tracing::debug!("[{}] Connection torn down", self.peer());
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}
