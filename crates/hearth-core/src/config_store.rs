//! Per-plugin configuration documents validated against the manifest schema.
//!
//! A document is never persisted unless the whole merged result satisfies the
//! schema. Writes are serialized through one async lock so a concurrent
//! read-merge-write cannot interleave.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::plugin::manifest::FieldProblem;
use crate::plugin::schema::ConfigSchema;

pub type ConfigDocument = Map<String, Value>;

/// A rejected configuration write. The previous document is retained.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub struct ConfigValidationError {
    pub plugin_id: String,
    pub problems: Vec<FieldProblem>,
}

impl fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid configuration for {}: ", self.plugin_id)?;
        let joined = self
            .problems
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        f.write_str(&joined)
    }
}

/// Durable storage for configuration documents.
#[async_trait::async_trait]
pub trait ConfigPersistence: Send + Sync {
    async fn load(&self, plugin_id: &str) -> Result<Option<ConfigDocument>>;
    async fn save(&self, plugin_id: &str, doc: &ConfigDocument) -> Result<()>;
    async fn delete(&self, plugin_id: &str) -> Result<()>;
}

/// Volatile persistence, the default when no store is configured.
#[derive(Debug, Default)]
pub struct MemoryConfigPersistence {
    docs: RwLock<HashMap<String, ConfigDocument>>,
}

impl MemoryConfigPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl ConfigPersistence for MemoryConfigPersistence {
    async fn load(&self, plugin_id: &str) -> Result<Option<ConfigDocument>> {
        Ok(self.docs.read().get(plugin_id).cloned())
    }

    async fn save(&self, plugin_id: &str, doc: &ConfigDocument) -> Result<()> {
        self.docs.write().insert(plugin_id.to_string(), doc.clone());
        Ok(())
    }

    async fn delete(&self, plugin_id: &str) -> Result<()> {
        self.docs.write().remove(plugin_id);
        Ok(())
    }
}

/// Validated key/value configuration per plugin.
pub struct ConfigStore {
    schemas: RwLock<HashMap<String, ConfigSchema>>,
    /// Last known valid document per plugin. Also the write lock.
    cache: Mutex<HashMap<String, ConfigDocument>>,
    persistence: Arc<dyn ConfigPersistence>,
}

impl ConfigStore {
    pub fn new(persistence: Arc<dyn ConfigPersistence>) -> Self {
        Self {
            schemas: RwLock::new(HashMap::new()),
            cache: Mutex::new(HashMap::new()),
            persistence,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryConfigPersistence::new()))
    }

    /// Attach the schema declared by a plugin's manifest. A plugin without a
    /// schema accepts no keys.
    pub async fn register_schema(&self, plugin_id: &str, schema: Option<ConfigSchema>) {
        let schema = schema.unwrap_or_default();
        let changed = {
            let mut schemas = self.schemas.write();
            let changed = schemas.get(plugin_id) != Some(&schema);
            schemas.insert(plugin_id.to_string(), schema);
            changed
        };
        if changed {
            // revalidate against the new schema on next read
            self.cache.lock().await.remove(plugin_id);
        }
    }

    pub fn schema(&self, plugin_id: &str) -> Option<ConfigSchema> {
        self.schemas.read().get(plugin_id).cloned()
    }

    fn require_schema(&self, plugin_id: &str) -> Result<ConfigSchema> {
        self.schema(plugin_id)
            .ok_or_else(|| Error::not_found(plugin_id))
    }

    /// Current document, or schema defaults when none has been written.
    pub async fn get(&self, plugin_id: &str) -> Result<ConfigDocument> {
        let schema = self.require_schema(plugin_id)?;
        let mut cache = self.cache.lock().await;
        self.current(plugin_id, &schema, &mut cache).await
    }

    async fn current(
        &self,
        plugin_id: &str,
        schema: &ConfigSchema,
        cache: &mut HashMap<String, ConfigDocument>,
    ) -> Result<ConfigDocument> {
        if let Some(doc) = cache.get(plugin_id) {
            return Ok(doc.clone());
        }

        let doc = match self.persistence.load(plugin_id).await? {
            Some(doc) => {
                let problems = schema.validate(&doc);
                if problems.is_empty() {
                    doc
                } else {
                    tracing::warn!(
                        plugin_id = %plugin_id,
                        problems = problems.len(),
                        "Persisted configuration no longer satisfies schema, using defaults"
                    );
                    schema.defaults()
                }
            }
            None => schema.defaults(),
        };

        cache.insert(plugin_id.to_string(), doc.clone());
        Ok(doc)
    }

    /// Read-merge-validate-persist.
    ///
    /// A `null` value resets the key to its schema default, or removes it
    /// when the property has none.
    pub async fn update(&self, plugin_id: &str, partial: ConfigDocument) -> Result<ConfigDocument> {
        let schema = self.require_schema(plugin_id)?;
        let mut cache = self.cache.lock().await;
        let mut merged = self.current(plugin_id, &schema, &mut cache).await?;

        let mut problems = Vec::new();
        for (key, value) in partial {
            if value.is_null() {
                match schema.get(&key) {
                    Some(prop) => match &prop.default {
                        Some(default) => {
                            merged.insert(key, default.clone());
                        }
                        None => {
                            merged.remove(&key);
                        }
                    },
                    None => problems.push(FieldProblem::new(key, "unknown key")),
                }
            } else {
                merged.insert(key, value);
            }
        }

        self.commit(plugin_id, &schema, merged, problems, &mut cache)
            .await
    }

    /// Validate-then-replace the whole document.
    pub async fn replace(&self, plugin_id: &str, doc: ConfigDocument) -> Result<ConfigDocument> {
        let schema = self.require_schema(plugin_id)?;
        let mut cache = self.cache.lock().await;
        self.commit(plugin_id, &schema, doc, Vec::new(), &mut cache)
            .await
    }

    async fn commit(
        &self,
        plugin_id: &str,
        schema: &ConfigSchema,
        doc: ConfigDocument,
        mut problems: Vec<FieldProblem>,
        cache: &mut HashMap<String, ConfigDocument>,
    ) -> Result<ConfigDocument> {
        problems.extend(schema.validate(&doc));
        if !problems.is_empty() {
            tracing::debug!(
                plugin_id = %plugin_id,
                problems = problems.len(),
                "Configuration update rejected"
            );
            return Err(ConfigValidationError {
                plugin_id: plugin_id.to_string(),
                problems,
            }
            .into());
        }

        self.persistence.save(plugin_id, &doc).await?;
        cache.insert(plugin_id.to_string(), doc.clone());
        tracing::info!(plugin_id = %plugin_id, keys = doc.len(), "Configuration updated");
        Ok(doc)
    }

    /// Drop the stored document; subsequent reads return defaults.
    pub async fn reset(&self, plugin_id: &str) -> Result<ConfigDocument> {
        let schema = self.require_schema(plugin_id)?;
        let mut cache = self.cache.lock().await;
        self.persistence.delete(plugin_id).await?;
        let defaults = schema.defaults();
        cache.insert(plugin_id.to_string(), defaults.clone());
        Ok(defaults)
    }

    /// Destroy the plugin's configuration and schema (uninstall).
    pub async fn forget(&self, plugin_id: &str) -> Result<()> {
        let mut cache = self.cache.lock().await;
        self.persistence.delete(plugin_id).await?;
        cache.remove(plugin_id);
        self.schemas.write().remove(plugin_id);
        Ok(())
    }
}

impl fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigStore")
            .field("plugins", &self.schemas.read().len())
            .finish_non_exhaustive()
    }
}

/// Configuration view scoped to one plugin, handed out through its context.
#[derive(Clone)]
pub struct PluginConfig {
    store: Arc<ConfigStore>,
    plugin_id: String,
}

impl PluginConfig {
    pub(crate) fn new(store: Arc<ConfigStore>, plugin_id: impl Into<String>) -> Self {
        Self {
            store,
            plugin_id: plugin_id.into(),
        }
    }

    pub async fn get(&self) -> Result<ConfigDocument> {
        self.store.get(&self.plugin_id).await
    }

    pub async fn value(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.get().await?.get(key).cloned())
    }

    pub async fn update(&self, partial: ConfigDocument) -> Result<ConfigDocument> {
        self.store.update(&self.plugin_id, partial).await
    }
}
