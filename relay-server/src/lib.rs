//! # relay-server
//!
//! WebSocket server for the relay.
//!
//! This crate provides:
//! - Connection acceptance and WebSocket upgrade
//! - A per-connection actor with concurrent read and write loops
//! - Command dispatch through a static router
//! - A per-connection subscription registry with one slot per topic
//! - Change feed forwarding from store cursors to connections
//! - Prometheus metrics

pub mod config;
pub mod connection;
pub mod error;
pub mod feed;
pub mod handlers;
pub mod metrics;
pub mod registry;
pub mod router;
pub mod server;
pub mod tables;

pub use config::{Config, ConfigError, MetricsConfig, NetworkConfig, StoreSection};
pub use connection::{Connection, ConnectionContext, OutboundQueue};
pub use error::ServerError;
pub use feed::{ChangeKind, Topic};
pub use metrics::Metrics;
pub use registry::{Slot, SubscriptionRegistry};
pub use router::{CommandRouter, Handler};
pub use server::{Server, ServerConfig, ServerStats};
