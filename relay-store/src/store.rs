//! Document store with live change cursors.

use crate::cursor::{Change, ChangeCursor, ChangesOptions};
use crate::error::StoreError;
use crate::query::Query;
use crate::snapshot::StoreSnapshot;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Tables indexed by name. Shared with cursors so they can deregister.
pub(crate) type Tables = DashMap<String, RwLock<Table>>;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database name; also names the snapshot file.
    pub database: String,
    /// Directory for the snapshot file (None = memory only).
    pub data_dir: Option<PathBuf>,
    /// Tables created at open.
    pub tables: Vec<String>,
    /// Tables excluded from snapshots.
    pub ephemeral_tables: Vec<String>,
}

impl StoreConfig {
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            data_dir: None,
            tables: Vec::new(),
            ephemeral_tables: Vec::new(),
        }
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    pub fn with_tables<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tables.extend(tables.into_iter().map(Into::into));
        self
    }

    pub fn with_ephemeral_tables<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ephemeral_tables
            .extend(tables.into_iter().map(Into::into));
        self
    }

    /// Returns the snapshot file path, if persistence is enabled.
    pub fn snapshot_path(&self) -> Option<PathBuf> {
        self.data_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.json", self.database)))
    }
}

struct Row {
    seq: u64,
    doc: Value,
}

struct Watcher {
    query: Query,
    tx: mpsc::UnboundedSender<Change>,
}

/// One table: rows plus the cursors watching it.
#[derive(Default)]
pub(crate) struct Table {
    rows: HashMap<String, Row>,
    watchers: HashMap<u64, Watcher>,
}

impl Table {
    /// Delivers a committed change to every interested watcher.
    /// Must be called while the table's write lock is held.
    fn publish(&mut self, change: &Change) {
        self.watchers.retain(|id, watcher| match change.project(&watcher.query) {
            Some(projected) => {
                let delivered = watcher.tx.send(projected).is_ok();
                if !delivered {
                    tracing::debug!("Dropping watcher {} with closed cursor", id);
                }
                delivered
            }
            None => true,
        });
    }

    /// Returns matching documents in query order.
    fn select(&self, query: &Query) -> Vec<Value> {
        let mut rows: Vec<(u64, Value)> = self
            .rows
            .values()
            .filter(|row| query.matches(&row.doc))
            .map(|row| (row.seq, row.doc.clone()))
            .collect();
        query.sort(&mut rows);
        rows.into_iter().map(|(_, doc)| doc).collect()
    }

    pub(crate) fn remove_watcher(&mut self, id: u64) -> bool {
        self.watchers.remove(&id).is_some()
    }

    fn documents_in_order(&self) -> Vec<Value> {
        let mut rows: Vec<(u64, &Value)> =
            self.rows.values().map(|row| (row.seq, &row.doc)).collect();
        rows.sort_by_key(|(seq, _)| *seq);
        rows.into_iter().map(|(_, doc)| doc.clone()).collect()
    }
}

/// An embedded document store.
///
/// Every mutation is published to watchers while the table lock is held, so
/// each cursor observes its table's changes in commit order.
pub struct Store {
    config: StoreConfig,
    tables: Arc<Tables>,
    next_seq: AtomicU64,
    next_watcher: AtomicU64,
}

impl Store {
    /// Opens a store, loading its snapshot file if one exists.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let store = Self {
            config,
            tables: Arc::new(DashMap::new()),
            next_seq: AtomicU64::new(1),
            next_watcher: AtomicU64::new(1),
        };

        for name in store.config.tables.clone() {
            store.create_table(&name);
        }

        if let Some(path) = store.config.snapshot_path() {
            if let Some(snapshot) = StoreSnapshot::load(&path)? {
                let count = store.restore(snapshot)?;
                tracing::info!(
                    "Loaded {} documents from snapshot {}",
                    count,
                    path.display()
                );
            }
        }

        Ok(store)
    }

    /// Creates a memory-only store with the given tables.
    pub fn in_memory(database: &str, tables: &[&str]) -> Self {
        let store = Self {
            config: StoreConfig::new(database).with_tables(tables.iter().copied()),
            tables: Arc::new(DashMap::new()),
            next_seq: AtomicU64::new(1),
            next_watcher: AtomicU64::new(1),
        };
        for name in tables {
            store.create_table(name);
        }
        store
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn database(&self) -> &str {
        &self.config.database
    }

    /// Creates a table. Returns false if it already exists.
    pub fn create_table(&self, name: &str) -> bool {
        let mut created = false;
        self.tables.entry(name.to_string()).or_insert_with(|| {
            created = true;
            RwLock::new(Table::default())
        });
        if created {
            tracing::debug!("Created table {}", name);
        }
        created
    }

    /// Returns table names, sorted.
    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.iter().map(|t| t.key().clone()).collect();
        names.sort();
        names
    }

    /// Inserts a document, returning its id.
    ///
    /// A string `id` field is used as the primary key; otherwise a UUID is
    /// generated and stored in `id`.
    pub fn insert(&self, table: &str, doc: Value) -> Result<String, StoreError> {
        let mut doc = into_object(doc)?;
        let id = match doc.get("id") {
            None | Some(Value::Null) => uuid::Uuid::new_v4().to_string(),
            Some(Value::String(id)) if !id.is_empty() => id.clone(),
            Some(other) => {
                return Err(StoreError::InvalidDocument(format!(
                    "primary key must be a non-empty string, got {}",
                    other
                )))
            }
        };
        doc.insert("id".to_string(), Value::String(id.clone()));
        let doc = Value::Object(doc);

        self.with_table(table, |t| {
            if t.rows.contains_key(&id) {
                return Err(StoreError::DuplicateKey {
                    table: table.to_string(),
                    id: id.clone(),
                });
            }
            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            t.rows.insert(
                id.clone(),
                Row {
                    seq,
                    doc: doc.clone(),
                },
            );
            t.publish(&Change::insert(doc));
            Ok(())
        })?;

        tracing::debug!("Inserted {}/{}", table, id);
        Ok(id)
    }

    /// Serializes and inserts a record, returning its id.
    pub fn insert_as<T: Serialize>(&self, table: &str, record: &T) -> Result<String, StoreError> {
        self.insert(table, serde_json::to_value(record)?)
    }

    /// Gets a document by id.
    pub fn get(&self, table: &str, id: &str) -> Result<Option<Value>, StoreError> {
        let table_ref = self
            .tables
            .get(table)
            .ok_or_else(|| StoreError::TableNotFound(table.to_string()))?;
        let guard = table_ref.read();
        Ok(guard.rows.get(id).map(|row| row.doc.clone()))
    }

    /// Merges the top-level fields of `patch` into a document and returns
    /// the result. The primary key cannot be changed. An update that leaves
    /// the document unchanged publishes nothing.
    pub fn update(&self, table: &str, id: &str, patch: Value) -> Result<Value, StoreError> {
        let patch = into_object(patch)?;

        self.with_table(table, |t| {
            let row = t.rows.get_mut(id).ok_or_else(|| StoreError::NotFound {
                table: table.to_string(),
                id: id.to_string(),
            })?;

            let old = row.doc.clone();
            if let Value::Object(fields) = &mut row.doc {
                for (key, value) in patch {
                    if key != "id" {
                        fields.insert(key, value);
                    }
                }
            }
            let new = row.doc.clone();

            if old != new {
                t.publish(&Change::update(old, new.clone()));
            }
            Ok(new)
        })
    }

    /// Deletes a document, returning it if it existed.
    pub fn delete(&self, table: &str, id: &str) -> Result<Option<Value>, StoreError> {
        self.with_table(table, |t| {
            let removed = t.rows.remove(id).map(|row| row.doc);
            if let Some(ref old) = removed {
                t.publish(&Change::delete(old.clone()));
            }
            Ok(removed)
        })
    }

    /// Returns the documents matching a query, in query order.
    pub fn list(&self, query: &Query) -> Result<Vec<Value>, StoreError> {
        let table_ref = self
            .tables
            .get(query.table_name())
            .ok_or_else(|| StoreError::TableNotFound(query.table_name().to_string()))?;
        let guard = table_ref.read();
        Ok(guard.select(query))
    }

    /// Returns the number of documents in a table.
    pub fn count(&self, table: &str) -> Result<usize, StoreError> {
        let table_ref = self
            .tables
            .get(table)
            .ok_or_else(|| StoreError::TableNotFound(table.to_string()))?;
        let len = table_ref.read().rows.len();
        Ok(len)
    }

    /// Opens a change cursor for a query.
    ///
    /// With `include_initial`, the current result set is queued as inserts
    /// before the cursor is registered; both happen under the table lock, so
    /// no change is missed or seen twice.
    pub fn changes(
        &self,
        query: Query,
        options: ChangesOptions,
    ) -> Result<ChangeCursor, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_watcher.fetch_add(1, Ordering::Relaxed);
        let table = query.table_name().to_string();

        self.with_table(&table, |t| {
            if options.include_initial {
                for doc in t.select(&query) {
                    // Receiver is alive; it is still held below.
                    let _ = tx.send(Change::insert(doc));
                }
            }
            t.watchers.insert(id, Watcher { query, tx });
            Ok(())
        })?;

        tracing::debug!("Opened change cursor {} on {}", id, table);
        Ok(ChangeCursor::new(id, table, rx, Arc::downgrade(&self.tables)))
    }

    /// Returns the number of open cursors on a table.
    pub fn watcher_count(&self, table: &str) -> usize {
        self.tables
            .get(table)
            .map(|t| t.read().watchers.len())
            .unwrap_or(0)
    }

    /// Writes the snapshot file. A no-op for memory-only stores.
    pub fn flush(&self) -> Result<(), StoreError> {
        let Some(path) = self.config.snapshot_path() else {
            return Ok(());
        };

        let mut snapshot = StoreSnapshot::new(&self.config.database);
        for entry in self.tables.iter() {
            if self.config.ephemeral_tables.contains(entry.key()) {
                continue;
            }
            snapshot
                .tables
                .insert(entry.key().clone(), entry.value().read().documents_in_order());
        }

        snapshot.write(&path)?;
        tracing::info!(
            "Wrote snapshot of {} documents to {}",
            snapshot.document_count(),
            path.display()
        );
        Ok(())
    }

    /// Loads snapshot documents into their tables without publishing.
    fn restore(&self, snapshot: StoreSnapshot) -> Result<usize, StoreError> {
        let mut count = 0;
        for (name, docs) in snapshot.tables {
            if self.config.ephemeral_tables.contains(&name) {
                continue;
            }
            self.create_table(&name);
            self.with_table(&name, |t| {
                for doc in docs {
                    let id = doc
                        .get("id")
                        .and_then(Value::as_str)
                        .ok_or_else(|| {
                            StoreError::Corruption(format!("document without id in {}", name))
                        })?
                        .to_string();
                    let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
                    t.rows.insert(id, Row { seq, doc });
                    count += 1;
                }
                Ok(())
            })?;
        }
        Ok(count)
    }

    fn with_table<R>(
        &self,
        name: &str,
        f: impl FnOnce(&mut Table) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let table = self
            .tables
            .get(name)
            .ok_or_else(|| StoreError::TableNotFound(name.to_string()))?;
        let mut guard = table.write();
        f(&mut guard)
    }
}

fn into_object(value: Value) -> Result<Map<String, Value>, StoreError> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(StoreError::InvalidDocument(format!(
            "expected an object, got {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::OrderBy;
    use serde_json::json;
    use tempfile::TempDir;

    fn test_store() -> Store {
        Store::in_memory("test", &["room", "user", "message"])
    }

    #[test]
    fn test_insert_generates_id() {
        let store = test_store();
        let id = store.insert("room", json!({"name": "general"})).unwrap();
        assert!(!id.is_empty());

        let doc = store.get("room", &id).unwrap().unwrap();
        assert_eq!(doc["id"], id.as_str());
        assert_eq!(doc["name"], "general");
    }

    #[test]
    fn test_insert_with_explicit_id() {
        let store = test_store();
        let id = store.insert("room", json!({"id": "r1", "name": "a"})).unwrap();
        assert_eq!(id, "r1");

        let err = store.insert("room", json!({"id": "r1", "name": "b"})).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey { .. }));
    }

    #[test]
    fn test_insert_rejects_non_objects() {
        let store = test_store();
        assert!(matches!(
            store.insert("room", json!("general")),
            Err(StoreError::InvalidDocument(_))
        ));
        assert!(matches!(
            store.insert("room", json!({"id": 5})),
            Err(StoreError::InvalidDocument(_))
        ));
    }

    #[test]
    fn test_missing_table() {
        let store = test_store();
        assert!(matches!(
            store.insert("nope", json!({})),
            Err(StoreError::TableNotFound(_))
        ));
        assert!(matches!(
            store.changes(Query::table("nope"), ChangesOptions::default()),
            Err(StoreError::TableNotFound(_))
        ));
    }

    #[test]
    fn test_update_merges_and_keeps_id() {
        let store = test_store();
        let id = store.insert("user", json!({"name": "anonymous"})).unwrap();

        let doc = store
            .update("user", &id, json!({"id": "other", "name": "ada"}))
            .unwrap();
        assert_eq!(doc["id"], id.as_str());
        assert_eq!(doc["name"], "ada");

        assert!(matches!(
            store.update("user", "missing", json!({"name": "x"})),
            Err(StoreError::NotFound { .. })
        ));
    }

    #[test]
    fn test_delete() {
        let store = test_store();
        let id = store.insert("user", json!({"name": "anonymous"})).unwrap();

        assert!(store.delete("user", &id).unwrap().is_some());
        assert!(store.delete("user", &id).unwrap().is_none());
        assert_eq!(store.count("user").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_changes_initial_then_live() {
        let store = test_store();
        store.insert("room", json!({"id": "r1", "name": "one"})).unwrap();
        store.insert("room", json!({"id": "r2", "name": "two"})).unwrap();

        let mut cursor = store
            .changes(Query::table("room"), ChangesOptions::include_initial())
            .unwrap();

        assert_eq!(cursor.next().await.unwrap().new.unwrap()["id"], "r1");
        assert_eq!(cursor.next().await.unwrap().new.unwrap()["id"], "r2");
        assert!(cursor.try_next().is_none());

        store.insert("room", json!({"id": "r3", "name": "three"})).unwrap();
        let change = cursor.next().await.unwrap();
        assert!(change.old.is_none());
        assert_eq!(change.new.unwrap()["id"], "r3");
    }

    #[tokio::test]
    async fn test_changes_without_initial() {
        let store = test_store();
        store.insert("room", json!({"name": "old"})).unwrap();

        let mut cursor = store
            .changes(Query::table("room"), ChangesOptions::default())
            .unwrap();
        assert!(cursor.try_next().is_none());

        store.insert("room", json!({"name": "new"})).unwrap();
        assert_eq!(cursor.next().await.unwrap().new.unwrap()["name"], "new");
    }

    #[tokio::test]
    async fn test_changes_update_and_delete() {
        let store = test_store();
        let id = store.insert("user", json!({"name": "anonymous"})).unwrap();
        let mut cursor = store
            .changes(Query::table("user"), ChangesOptions::default())
            .unwrap();

        store.update("user", &id, json!({"name": "ada"})).unwrap();
        // No-op update publishes nothing
        store.update("user", &id, json!({"name": "ada"})).unwrap();
        store.delete("user", &id).unwrap();

        let change = cursor.next().await.unwrap();
        assert_eq!(change.old.unwrap()["name"], "anonymous");
        assert_eq!(change.new.unwrap()["name"], "ada");

        let change = cursor.next().await.unwrap();
        assert_eq!(change.old.unwrap()["name"], "ada");
        assert!(change.new.is_none());

        assert!(cursor.try_next().is_none());
    }

    #[tokio::test]
    async fn test_changes_filtered_and_ordered() {
        let store = test_store();
        store
            .insert(
                "message",
                json!({"roomId": "R1", "body": "first", "createdAt": "2024-01-01T00:00:01Z"}),
            )
            .unwrap();
        store
            .insert(
                "message",
                json!({"roomId": "R2", "body": "other", "createdAt": "2024-01-01T00:00:02Z"}),
            )
            .unwrap();
        store
            .insert(
                "message",
                json!({"roomId": "R1", "body": "second", "createdAt": "2024-01-01T00:00:03Z"}),
            )
            .unwrap();

        let query = Query::table("message")
            .filter_eq("roomId", "R1")
            .order_by(OrderBy::desc("createdAt"));
        let mut cursor = store
            .changes(query, ChangesOptions::include_initial())
            .unwrap();

        assert_eq!(cursor.next().await.unwrap().new.unwrap()["body"], "second");
        assert_eq!(cursor.next().await.unwrap().new.unwrap()["body"], "first");

        store
            .insert("message", json!({"roomId": "R2", "body": "skip"}))
            .unwrap();
        store
            .insert("message", json!({"roomId": "R1", "body": "live"}))
            .unwrap();
        assert_eq!(cursor.next().await.unwrap().new.unwrap()["body"], "live");
        assert!(cursor.try_next().is_none());
    }

    #[tokio::test]
    async fn test_close_deregisters() {
        let store = test_store();
        let mut cursor = store
            .changes(Query::table("room"), ChangesOptions::default())
            .unwrap();
        assert_eq!(store.watcher_count("room"), 1);

        store.insert("room", json!({"name": "buffered"})).unwrap();
        cursor.close();
        cursor.close();
        assert!(cursor.is_closed());
        assert_eq!(store.watcher_count("room"), 0);

        // Buffered and later changes are never returned
        store.insert("room", json!({"name": "late"})).unwrap();
        assert!(cursor.next().await.is_none());
    }

    #[test]
    fn test_drop_deregisters() {
        let store = test_store();
        let cursor = store
            .changes(Query::table("room"), ChangesOptions::default())
            .unwrap();
        assert_eq!(store.watcher_count("room"), 1);
        drop(cursor);
        assert_eq!(store.watcher_count("room"), 0);
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig::new("chat")
            .with_data_dir(dir.path())
            .with_tables(["room", "user", "message"])
            .with_ephemeral_tables(["user"]);

        {
            let store = Store::open(config.clone()).unwrap();
            store.insert("room", json!({"id": "r1", "name": "one"})).unwrap();
            store.insert("room", json!({"id": "r2", "name": "two"})).unwrap();
            store.insert("user", json!({"name": "anonymous"})).unwrap();
            store.flush().unwrap();
        }

        assert!(dir.path().join("chat.json").exists());

        let store = Store::open(config).unwrap();
        assert_eq!(store.count("room").unwrap(), 2);
        assert_eq!(store.count("user").unwrap(), 0);

        let rooms = store.list(&Query::table("room")).unwrap();
        assert_eq!(rooms[0]["id"], "r1");
        assert_eq!(rooms[1]["id"], "r2");
    }

    #[test]
    fn test_flush_memory_only_is_noop() {
        let store = test_store();
        store.insert("room", json!({"name": "x"})).unwrap();
        store.flush().unwrap();
    }
}
