//! Snapshot file persistence.

use crate::error::StoreError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, Write};
use std::path::Path;

/// On-disk image of a database: documents per table, in insertion order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub database: String,
    #[serde(default)]
    pub tables: BTreeMap<String, Vec<Value>>,
}

impl StoreSnapshot {
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            tables: BTreeMap::new(),
        }
    }

    pub fn document_count(&self) -> usize {
        self.tables.values().map(Vec::len).sum()
    }

    /// Loads a snapshot file. Returns `None` if the file does not exist.
    pub fn load(path: &Path) -> Result<Option<Self>, StoreError> {
        if !path.exists() {
            return Ok(None);
        }

        let file = File::open(path)?;
        let snapshot: Self = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| StoreError::Corruption(format!("{}: {}", path.display(), e)))?;
        Ok(Some(snapshot))
    }

    /// Writes the snapshot, replacing any previous file atomically.
    pub fn write(&self, path: &Path) -> Result<(), StoreError> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }

        let data = serde_json::to_vec_pretty(self)?;
        let tmp_path = path.with_extension("json.tmp");

        let mut file = File::create(&tmp_path)?;
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp_path, path)?;
        Ok(())
    }
}
