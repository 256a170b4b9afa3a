//! # relay-store
//!
//! Embedded document store for the relay.
//!
//! This crate provides:
//! - Named tables of JSON documents keyed by string `id`
//! - Insert, get, update and delete by id
//! - Live change cursors over filtered queries, optionally preceded by
//!   the current result set as synthetic inserts
//! - Optional JSON snapshot persistence

pub mod cursor;
pub mod error;
pub mod query;
pub mod snapshot;
pub mod store;

pub use cursor::{Change, ChangeCursor, ChangesOptions};
pub use error::StoreError;
pub use query::{OrderBy, Query};
pub use snapshot::StoreSnapshot;
pub use store::{Store, StoreConfig};
