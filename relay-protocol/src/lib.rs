//! # relay-protocol
//!
//! Wire protocol for the relay.
//!
//! This crate provides:
//! - The `{name, data}` envelope exchanged in both directions
//! - Command and event name constants
//! - Domain models for rooms, users and chat messages
//! - JSON text encoding with size limits

pub mod codec;
pub mod envelope;
pub mod error;
pub mod model;
pub mod names;

pub use codec::{Decoder, Encoder};
pub use envelope::Envelope;
pub use error::ProtocolError;
pub use model::{ChatMessage, MessageDraft, Room, User};

/// Default port for the relay server.
pub const DEFAULT_PORT: u16 = 4000;

/// Maximum encoded envelope size (1 MiB).
pub const MAX_ENVELOPE_SIZE: usize = 1024 * 1024;
