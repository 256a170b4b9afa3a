//! WebSocket acceptor.

use crate::connection::{Connection, ConnectionContext};
use crate::error::ServerError;
use crate::metrics::Metrics;
use crate::router::CommandRouter;
use relay_protocol::DEFAULT_PORT;
use relay_store::Store;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

/// Acceptor settings.
#[derive(Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// Connections beyond this are dropped before the upgrade.
    pub max_connections: usize,
    /// Per-connection outbound queue capacity.
    pub outbound_capacity: usize,
    pub metrics: Option<Arc<Metrics>>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)))
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_connections: 1000,
            outbound_capacity: 256,
            metrics: None,
        }
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_outbound_capacity(mut self, capacity: usize) -> Self {
        self.outbound_capacity = capacity;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

/// Connection counters, readable while the server runs.
#[derive(Debug, Default)]
pub struct ServerStats {
    /// Connections admitted.
    pub accepted: AtomicU64,
    /// Connections currently held.
    pub active: AtomicU64,
    /// Connections dropped at the limit.
    pub rejected: AtomicU64,
    /// Connections that ended with an error (failed upgrade, store failure).
    pub failed: AtomicU64,
}

/// Holds one connection's place under the limit. Releases it on drop.
struct Admission {
    stats: Arc<ServerStats>,
    metrics: Option<Arc<Metrics>>,
}

impl Drop for Admission {
    fn drop(&mut self) {
        self.stats.active.fetch_sub(1, Ordering::Relaxed);
        if let Some(ref metrics) = self.metrics {
            metrics.connections_active.dec();
        }
    }
}

/// WebSocket server for the relay.
pub struct Server {
    config: ServerConfig,
    context: ConnectionContext,
    stats: Arc<ServerStats>,
    shutdown: CancellationToken,
    connections: TaskTracker,
    running: AtomicBool,
}

impl Server {
    pub fn new(config: ServerConfig, store: Arc<Store>, router: Arc<CommandRouter>) -> Self {
        let mut context = ConnectionContext::new(store, router)
            .with_outbound_capacity(config.outbound_capacity);
        if let Some(metrics) = config.metrics.clone() {
            context = context.with_metrics(metrics);
        }
        Self {
            config,
            context,
            stats: Arc::default(),
            shutdown: CancellationToken::new(),
            connections: TaskTracker::new(),
            running: AtomicBool::new(false),
        }
    }

    /// Binds the configured address and serves until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serves connections from a bound listener until shutdown. Returns once
    /// every live connection has been torn down.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let local_addr = listener.local_addr()?;
        self.running.store(true, Ordering::SeqCst);
        tracing::info!("Relay listening on ws://{}", local_addr);

        while let Some(accepted) = self
            .shutdown
            .run_until_cancelled(listener.accept())
            .await
        {
            match accepted {
                Ok((tcp_stream, peer)) => self.admit(tcp_stream, peer),
                Err(e) => tracing::error!("Failed to accept connection: {}", e),
            }
        }

        tracing::info!(
            "Stopped accepting; waiting for {} connection(s) to close",
            self.connections.len()
        );
        self.connections.close();
        self.connections.wait().await;
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn try_admit(&self) -> Option<Admission> {
        let limit = self.config.max_connections as u64;
        let admitted = self
            .stats
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |active| {
                (active < limit).then_some(active + 1)
            })
            .is_ok();
        if !admitted {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        self.stats.accepted.fetch_add(1, Ordering::Relaxed);
        if let Some(ref metrics) = self.config.metrics {
            metrics.connections_total.inc();
            metrics.connections_active.inc();
        }
        Some(Admission {
            stats: self.stats.clone(),
            metrics: self.config.metrics.clone(),
        })
    }

    fn admit(&self, tcp_stream: TcpStream, peer: SocketAddr) {
        let Some(admission) = self.try_admit() else {
            tracing::warn!(
                "At {} connections, refusing {}",
                self.config.max_connections,
                peer
            );
            return;
        };

        let context = self.context.clone();
        let stats = self.stats.clone();
        let shutdown = self.shutdown.clone();

        self.connections.spawn(
            async move {
                let _admission = admission;
                match Self::handle_connection(tcp_stream, peer, context, shutdown).await {
                    Ok(()) | Err(ServerError::ShuttingDown) => {}
                    Err(e) => {
                        tracing::debug!("Connection ended with error: {}", e);
                        stats.failed.fetch_add(1, Ordering::Relaxed);
                    }
                }
                tracing::info!("Client disconnected");
            }
            .instrument(tracing::info_span!("connection", %peer)),
        );
    }

    /// Upgrades a TCP stream and runs its connection until it ends or the
    /// server shuts down.
    async fn handle_connection(
        tcp_stream: TcpStream,
        peer: SocketAddr,
        context: ConnectionContext,
        shutdown: CancellationToken,
    ) -> Result<(), ServerError> {
        disable_nagle(&tcp_stream);
        let socket = tokio_tungstenite::accept_async(tcp_stream).await?;
        let (conn, outbound_rx) = Connection::open(&context, Some(peer))?;
        tracing::info!("Client connected as user {}", conn.id());

        if conn.serve_until(socket, outbound_rx, shutdown).await {
            Err(ServerError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    /// Stops accepting and tears down every live connection. Idempotent.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Token cancelled on shutdown, for companion services.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.context.store
    }
}

/// Sends each frame as soon as it is written.
fn disable_nagle(tcp_stream: &TcpStream) {
    if let Err(e) = tcp_stream.set_nodelay(true) {
        tracing::warn!("Failed to set TCP_NODELAY: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers;
    use crate::tables;

    fn test_server(config: ServerConfig) -> Arc<Server> {
        let store = Arc::new(Store::in_memory("test", tables::ALL));
        let mut router = CommandRouter::new();
        handlers::register_all(&mut router);
        Arc::new(Server::new(config, store, Arc::new(router)))
    }

    #[test]
    fn test_config_builders() {
        let config = ServerConfig::default()
            .with_max_connections(2)
            .with_outbound_capacity(8);
        assert_eq!(config.bind_addr.port(), DEFAULT_PORT);
        assert_eq!(config.max_connections, 2);
        assert_eq!(config.outbound_capacity, 8);
        assert!(config.metrics.is_none());
    }

    #[test]
    fn test_admission_limit() {
        let server = test_server(ServerConfig::default().with_max_connections(2));

        let first = server.try_admit().unwrap();
        let _second = server.try_admit().unwrap();
        assert!(server.try_admit().is_none());
        assert_eq!(server.stats().rejected.load(Ordering::Relaxed), 1);

        drop(first);
        assert_eq!(server.stats().active.load(Ordering::Relaxed), 1);
        assert!(server.try_admit().is_some());
        assert_eq!(server.stats().accepted.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_accepted_sockets_disable_nagle() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _client = TcpStream::connect(addr).await.unwrap();
        let (accepted, _) = listener.accept().await.unwrap();

        disable_nagle(&accepted);
        assert!(accepted.nodelay().unwrap());
    }

    #[tokio::test]
    async fn test_serve_and_shutdown() {
        let server = test_server(ServerConfig::default());
        assert!(!server.is_running());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let handle = {
            let server = server.clone();
            tokio::spawn(async move { server.serve(listener).await })
        };

        while !server.is_running() {
            tokio::task::yield_now().await;
        }
        server.shutdown();
        handle.await.unwrap().unwrap();
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn test_shutdown_before_serve() {
        let server = test_server(ServerConfig::default());
        let token = server.shutdown_token();
        server.shutdown();
        assert!(token.is_cancelled());

        // Returns immediately since the token is already cancelled
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        server.serve(listener).await.unwrap();
    }
}
