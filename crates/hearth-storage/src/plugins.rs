//! Durable plugin registry records and configuration documents.
//!
//! One redb file holds two tables keyed by plugin id, both with JSON values:
//! `plugins` for [`PersistedRecord`]s and `plugin_configs` for configuration
//! documents.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use serde::{Deserialize, Serialize};

use hearth_core::config_store::{ConfigDocument, ConfigPersistence};
use hearth_core::plugin::registry::{PersistedRecord, RecordStore};

use crate::error::{Error, Result};

// key = plugin id, value = PersistedRecord (JSON)
const PLUGINS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("plugins");

// key = plugin id, value = configuration document (JSON)
const CONFIGS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("plugin_configs");

/// Counts reported by [`PluginStore::stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub records: usize,
    pub enabled: usize,
    pub configs: usize,
}

/// redb-backed plugin store.
#[derive(Clone)]
pub struct PluginStore {
    db: Arc<Database>,
    path: PathBuf,
}

impl PluginStore {
    /// Open the database at `path`, creating it when missing.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let db = if path.exists() {
            Database::open(path)?
        } else {
            Database::create(path)?
        };

        let store = Self {
            db: Arc::new(db),
            path: path.to_path_buf(),
        };
        store.ensure_tables()?;
        tracing::debug!(path = %store.path.display(), "Plugin store opened");
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_tables(&self) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let _ = write_txn.open_table(PLUGINS_TABLE)?;
            let _ = write_txn.open_table(CONFIGS_TABLE)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn put(&self, table: TableDefinition<&str, &[u8]>, key: &str, value: &[u8]) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(table)?;
            table.insert(key, value)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn remove(&self, table: TableDefinition<&str, &[u8]>, key: &str) -> Result<bool> {
        let write_txn = self.db.begin_write()?;
        let existed = {
            let mut table = write_txn.open_table(table)?;
            let removed = table.remove(key)?;
            removed.is_some()
        };
        write_txn.commit()?;
        Ok(existed)
    }

    // ========================================================================
    // Registry records
    // ========================================================================

    pub fn save_record(&self, record: &PersistedRecord) -> Result<()> {
        let value = serde_json::to_vec(record)?;
        self.put(PLUGINS_TABLE, &record.manifest.id, &value)
    }

    pub fn load_record(&self, id: &str) -> Result<Option<PersistedRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(PLUGINS_TABLE)?;

        match table.get(id)? {
            Some(data) => Ok(Some(decode_record(id, data.value())?)),
            None => Ok(None),
        }
    }

    /// Every record, ordered by plugin id. Undecodable entries are skipped
    /// with a warning.
    pub fn load_records(&self) -> Result<Vec<PersistedRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(PLUGINS_TABLE)?;

        let mut records = Vec::new();
        for result in table.iter()? {
            let (key, data) = result?;
            match decode_record(key.value(), data.value()) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(plugin_id = %key.value(), error = %e, "Skipping stored record"),
            }
        }
        Ok(records)
    }

    pub fn delete_record(&self, id: &str) -> Result<bool> {
        self.remove(PLUGINS_TABLE, id)
    }

    // ========================================================================
    // Configuration documents
    // ========================================================================

    pub fn save_config(&self, id: &str, doc: &ConfigDocument) -> Result<()> {
        let value = serde_json::to_vec(doc)?;
        self.put(CONFIGS_TABLE, id, &value)
    }

    pub fn load_config(&self, id: &str) -> Result<Option<ConfigDocument>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(CONFIGS_TABLE)?;

        match table.get(id)? {
            Some(data) => Ok(Some(serde_json::from_slice(data.value())?)),
            None => Ok(None),
        }
    }

    pub fn delete_config(&self, id: &str) -> Result<bool> {
        self.remove(CONFIGS_TABLE, id)
    }

    /// Plugin ids with a stored configuration document.
    pub fn config_ids(&self) -> Result<Vec<String>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(CONFIGS_TABLE)?;

        let mut ids = Vec::new();
        for result in table.iter()? {
            let (key, _) = result?;
            ids.push(key.value().to_string());
        }
        Ok(ids)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        let records = self.load_records()?;
        let read_txn = self.db.begin_read()?;
        let configs = read_txn.open_table(CONFIGS_TABLE)?.len()? as usize;

        Ok(StoreStats {
            enabled: records.iter().filter(|r| r.enabled).count(),
            records: records.len(),
            configs,
        })
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(PluginStore) -> Result<T> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || f(store)).await?
    }
}

impl std::fmt::Debug for PluginStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

fn decode_record(key: &str, data: &[u8]) -> Result<PersistedRecord> {
    let record: PersistedRecord = serde_json::from_slice(data)?;
    if record.manifest.id != key {
        return Err(Error::Corrupt {
            key: key.to_string(),
            reason: format!("stored manifest id is '{}'", record.manifest.id),
        });
    }
    Ok(record)
}

#[async_trait::async_trait]
impl RecordStore for PluginStore {
    async fn load_all(&self) -> hearth_core::Result<Vec<PersistedRecord>> {
        let mut records = self.blocking(|s| s.load_records()).await?;
        records.sort_by(|a, b| a.manifest.id.cmp(&b.manifest.id));
        Ok(records)
    }

    async fn save(&self, record: &PersistedRecord) -> hearth_core::Result<()> {
        let record = record.clone();
        Ok(self.blocking(move |s| s.save_record(&record)).await?)
    }

    async fn delete(&self, plugin_id: &str) -> hearth_core::Result<()> {
        let id = plugin_id.to_string();
        self.blocking(move |s| s.delete_record(&id)).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl ConfigPersistence for PluginStore {
    async fn load(&self, plugin_id: &str) -> hearth_core::Result<Option<ConfigDocument>> {
        let id = plugin_id.to_string();
        Ok(self.blocking(move |s| s.load_config(&id)).await?)
    }

    async fn save(&self, plugin_id: &str, doc: &ConfigDocument) -> hearth_core::Result<()> {
        let id = plugin_id.to_string();
        let doc = doc.clone();
        Ok(self.blocking(move |s| s.save_config(&id, &doc)).await?)
    }

    async fn delete(&self, plugin_id: &str) -> hearth_core::Result<()> {
        let id = plugin_id.to_string();
        self.blocking(move |s| s.delete_config(&id)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use hearth_core::plugin::ManifestValidator;
    use serde_json::json;
    use tempfile::TempDir;

    fn record(id: &str, enabled: bool) -> PersistedRecord {
        let manifest = ManifestValidator::validate(&json!({
            "id": id,
            "name": id,
            "version": "1.2.0",
            "author": "a",
            "description": "d",
            "plugin_type": "integration",
            "main_class": "noop",
            "api_version": "1.0",
            "permissions": ["devices.read"],
            "config_schema": { "interval": { "type": "integer", "default": 5 } }
        }))
        .unwrap();
        PersistedRecord {
            manifest,
            enabled,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_record_save_load_delete() {
        let tmp = TempDir::new().unwrap();
        let store = PluginStore::open(tmp.path().join("hearth.redb")).unwrap();

        store.save_record(&record("p1", true)).unwrap();
        store.save_record(&record("p2", false)).unwrap();

        let loaded = store.load_record("p1").unwrap().unwrap();
        assert_eq!(loaded.manifest, record("p1", true).manifest);
        assert_eq!(store.load_records().unwrap().len(), 2);

        assert!(store.delete_record("p1").unwrap());
        assert!(!store.delete_record("p1").unwrap());
        assert!(store.load_record("p1").unwrap().is_none());
    }

    #[test]
    fn test_config_documents() {
        let tmp = TempDir::new().unwrap();
        let store = PluginStore::open(tmp.path().join("hearth.redb")).unwrap();

        let doc = json!({"interval": 30}).as_object().cloned().unwrap();
        store.save_config("p1", &doc).unwrap();
        assert_eq!(store.load_config("p1").unwrap(), Some(doc));
        assert_eq!(store.config_ids().unwrap(), vec!["p1"]);

        store.delete_config("p1").unwrap();
        assert!(store.load_config("p1").unwrap().is_none());
    }

    #[test]
    fn test_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("hearth.redb");
        {
            let store = PluginStore::open(&path).unwrap();
            store.save_record(&record("p1", false)).unwrap();
        }
        let store = PluginStore::open(&path).unwrap();
        let stats = store.stats().unwrap();
        assert_eq!(stats.records, 1);
        assert_eq!(stats.enabled, 0);
        assert!(!store.load_record("p1").unwrap().unwrap().enabled);
    }

    #[test]
    fn test_mismatched_key_is_corrupt() {
        let tmp = TempDir::new().unwrap();
        let store = PluginStore::open(tmp.path().join("hearth.redb")).unwrap();
        let value = serde_json::to_vec(&record("p2", true)).unwrap();
        store.put(PLUGINS_TABLE, "p1", &value).unwrap();

        assert!(matches!(store.load_record("p1"), Err(Error::Corrupt { .. })));
        assert!(store.load_records().unwrap().is_empty());
    }
}
