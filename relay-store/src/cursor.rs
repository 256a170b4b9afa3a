//! Live change cursors.

use crate::query::Query;
use crate::store::Tables;
use serde_json::Value;
use std::sync::Weak;
use tokio::sync::mpsc;

/// A before/after pair for one document.
///
/// `old == None` is an insert, `new == None` a delete, both present an update.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub old: Option<Value>,
    pub new: Option<Value>,
}

impl Change {
    pub fn insert(new: Value) -> Self {
        Self {
            old: None,
            new: Some(new),
        }
    }

    pub fn update(old: Value, new: Value) -> Self {
        Self {
            old: Some(old),
            new: Some(new),
        }
    }

    pub fn delete(old: Value) -> Self {
        Self {
            old: Some(old),
            new: None,
        }
    }

    /// Projects this change through a query's filters.
    ///
    /// A side that does not match becomes `None`, so a document moving out
    /// of the result set reads as a delete and one moving in as an insert.
    /// Returns `None` if neither side matches.
    pub(crate) fn project(&self, query: &Query) -> Option<Change> {
        let old = self.old.as_ref().filter(|doc| query.matches(doc)).cloned();
        let new = self.new.as_ref().filter(|doc| query.matches(doc)).cloned();
        if old.is_none() && new.is_none() {
            return None;
        }
        Some(Change { old, new })
    }
}

/// Options for opening a change cursor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangesOptions {
    /// Deliver the current result set as inserts before live changes.
    pub include_initial: bool,
}

impl ChangesOptions {
    pub fn include_initial() -> Self {
        Self {
            include_initial: true,
        }
    }
}

/// A stream of changes for one query.
///
/// Closing the cursor (explicitly or by dropping it) deregisters it from
/// its table; no change is returned after `close`.
pub struct ChangeCursor {
    id: u64,
    table: String,
    rx: mpsc::UnboundedReceiver<Change>,
    tables: Weak<Tables>,
    closed: bool,
}

impl ChangeCursor {
    pub(crate) fn new(
        id: u64,
        table: String,
        rx: mpsc::UnboundedReceiver<Change>,
        tables: Weak<Tables>,
    ) -> Self {
        Self {
            id,
            table,
            rx,
            tables,
            closed: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Waits for the next change.
    ///
    /// Returns `None` once the cursor is closed or its table is gone.
    /// Cancel-safe: dropping the future loses no change.
    pub async fn next(&mut self) -> Option<Change> {
        if self.closed {
            return None;
        }
        self.rx.recv().await
    }

    /// Returns the next change if one is already buffered.
    pub fn try_next(&mut self) -> Option<Change> {
        if self.closed {
            return None;
        }
        self.rx.try_recv().ok()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Deregisters the cursor and discards buffered changes. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Some(tables) = self.tables.upgrade() {
            if let Some(table) = tables.get(&self.table) {
                table.write().remove_watcher(self.id);
            }
        }
        self.rx.close();
        while self.rx.try_recv().is_ok() {}

        tracing::debug!("Closed change cursor {} on {}", self.id, self.table);
    }
}

impl Drop for ChangeCursor {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for ChangeCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeCursor")
            .field("id", &self.id)
            .field("table", &self.table)
            .field("closed", &self.closed)
            .finish()
    }
}
