//! Store error types.

use thiserror::Error;

/// Errors from the store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("table not found: {0}")]
    TableNotFound(String),

    #[error("document not found: {table}/{id}")]
    NotFound { table: String, id: String },

    #[error("duplicate primary key: {table}/{id}")]
    DuplicateKey { table: String, id: String },

    #[error("invalid document: {0}")]
    InvalidDocument(String),

    #[error("data corruption: {0}")]
    Corruption(String),
}
