//! # relay-client
//!
//! Client library for the relay.
//!
//! This crate provides:
//! - Async WebSocket connection with a background read task
//! - Typed helpers for every relay command
//! - Event receipt with timeouts and name filtering

pub mod client;
pub mod connection;
pub mod error;

pub use client::Client;
pub use connection::{Connection, ConnectionConfig};
pub use error::ClientError;
