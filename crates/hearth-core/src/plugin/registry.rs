//! Durable map of plugin id to record.
//!
//! The registry owns the records, but only the lifecycle controller mutates a
//! record's state. Each entry carries its own async operation lock; lifecycle
//! operations on one id are serialized through it while different ids proceed
//! concurrently.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock as SyncRwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};

use super::context::PluginSession;
use super::instance::InstanceHandle;
use super::manifest::{Manifest, ManifestValidator};
use super::state::{PluginState, StateMachine, StateTransition};
use crate::error::{Error, Result};

/// Snapshot of a plugin record.
#[derive(Clone)]
pub struct PluginRecord {
    pub manifest: Arc<Manifest>,
    pub state: PluginState,
    pub enabled: bool,
    /// Most recent failure cause; cleared on the next successful start.
    pub last_error: Option<String>,
    /// Running instance, present from `loaded` onwards.
    pub handle: Option<InstanceHandle>,
    /// Events with an active hook registration.
    pub hooks: Vec<String>,
    /// Names of unfinished background tasks.
    pub tasks: Vec<String>,
    pub registered_at: DateTime<Utc>,
    pub history: Vec<StateTransition>,
}

impl PluginRecord {
    pub fn id(&self) -> &str {
        &self.manifest.id
    }
}

impl fmt::Debug for PluginRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRecord")
            .field("id", &self.manifest.id)
            .field("state", &self.state)
            .field("enabled", &self.enabled)
            .field("last_error", &self.last_error)
            .field("loaded", &self.handle.is_some())
            .field("hooks", &self.hooks)
            .field("tasks", &self.tasks)
            .finish()
    }
}

/// The persisted part of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedRecord {
    pub manifest: Manifest,
    pub enabled: bool,
    pub updated_at: DateTime<Utc>,
}

/// Durable storage for registry records.
#[async_trait::async_trait]
pub trait RecordStore: Send + Sync {
    async fn load_all(&self) -> Result<Vec<PersistedRecord>>;
    async fn save(&self, record: &PersistedRecord) -> Result<()>;
    async fn delete(&self, plugin_id: &str) -> Result<()>;
}

/// Volatile record store, the default when no store is configured.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: SyncRwLock<HashMap<String, PersistedRecord>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl RecordStore for MemoryRecordStore {
    async fn load_all(&self) -> Result<Vec<PersistedRecord>> {
        let mut records: Vec<_> = self.records.read().values().cloned().collect();
        records.sort_by(|a, b| a.manifest.id.cmp(&b.manifest.id));
        Ok(records)
    }

    async fn save(&self, record: &PersistedRecord) -> Result<()> {
        self.records
            .write()
            .insert(record.manifest.id.clone(), record.clone());
        Ok(())
    }

    async fn delete(&self, plugin_id: &str) -> Result<()> {
        self.records.write().remove(plugin_id);
        Ok(())
    }
}

/// Mutable record contents.
pub(crate) struct Slot {
    pub(crate) manifest: Arc<Manifest>,
    pub(crate) machine: StateMachine,
    pub(crate) enabled: bool,
    pub(crate) last_error: Option<String>,
    pub(crate) handle: Option<InstanceHandle>,
    pub(crate) session: Option<Arc<PluginSession>>,
    pub(crate) registered_at: DateTime<Utc>,
}

impl Slot {
    fn new(manifest: Arc<Manifest>, enabled: bool) -> Self {
        Self {
            manifest,
            machine: StateMachine::new(),
            enabled,
            last_error: None,
            handle: None,
            session: None,
            registered_at: Utc::now(),
        }
    }

    pub(crate) fn state(&self) -> PluginState {
        self.machine.current()
    }

    pub(crate) fn snapshot(&self) -> PluginRecord {
        let (hooks, tasks) = match &self.session {
            Some(s) => (s.hook_events(), s.task_names()),
            None => (Vec::new(), Vec::new()),
        };
        PluginRecord {
            manifest: self.manifest.clone(),
            state: self.machine.current(),
            enabled: self.enabled,
            last_error: self.last_error.clone(),
            handle: self.handle.clone(),
            hooks,
            tasks,
            registered_at: self.registered_at,
            history: self.machine.history().to_vec(),
        }
    }

    pub(crate) fn persisted(&self) -> PersistedRecord {
        PersistedRecord {
            manifest: (*self.manifest).clone(),
            enabled: self.enabled,
            updated_at: Utc::now(),
        }
    }
}

/// One registry entry.
pub(crate) struct PluginEntry {
    /// Serializes lifecycle operations on this id.
    pub(crate) op_lock: Mutex<()>,
    pub(crate) slot: SyncRwLock<Slot>,
}

impl PluginEntry {
    fn new(slot: Slot) -> Arc<Self> {
        Arc::new(Self {
            op_lock: Mutex::new(()),
            slot: SyncRwLock::new(slot),
        })
    }

    pub(crate) fn state(&self) -> PluginState {
        self.slot.read().state()
    }

    pub(crate) fn snapshot(&self) -> PluginRecord {
        self.slot.read().snapshot()
    }
}

/// Outcome of [`PluginRegistry::reconcile`].
#[derive(Debug, Default)]
pub struct ReconcileReport {
    /// Freshly discovered manifests now in the registry.
    pub registered: Vec<String>,
    /// Persisted records with no discovered manifest, restored as-is.
    pub restored: Vec<String>,
    /// Manifests that could not be registered.
    pub rejected: Vec<(String, Error)>,
}

/// Plugin id to record.
pub struct PluginRegistry {
    entries: RwLock<HashMap<String, Arc<PluginEntry>>>,
    store: Arc<dyn RecordStore>,
}

impl PluginRegistry {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            store,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryRecordStore::new()))
    }

    /// Validate raw manifest data and register it.
    pub async fn register_raw(&self, raw: &Value) -> Result<PluginRecord> {
        let manifest = ManifestValidator::validate(raw)?;
        self.register(manifest).await
    }

    /// Register an accepted manifest.
    ///
    /// * New id: a `discovered` record is created with `enabled = true`.
    /// * Identical manifest over an inactive record: no-op.
    /// * Different manifest over an inactive record: replaced, keeping the
    ///   enabled flag.
    /// * Any manifest over an active record: [`Error::Conflict`].
    pub async fn register(&self, manifest: Manifest) -> Result<PluginRecord> {
        self.register_with(manifest, None).await
    }

    async fn register_with(
        &self,
        manifest: Manifest,
        enabled_override: Option<bool>,
    ) -> Result<PluginRecord> {
        let id = manifest.id.clone();
        let mut entries = self.entries.write().await;

        let mut enabled = enabled_override.unwrap_or(true);
        if let Some(existing) = entries.get(&id) {
            let Ok(_guard) = existing.op_lock.try_lock() else {
                return Err(Error::Conflict {
                    id,
                    state: existing.state(),
                });
            };
            let slot = existing.slot.read();
            let state = slot.state();
            if state.is_active() {
                return Err(Error::Conflict { id, state });
            }
            if *slot.manifest == manifest && enabled_override.map_or(true, |e| e == slot.enabled)
            {
                tracing::debug!(plugin_id = %id, "Identical manifest already registered");
                return Ok(slot.snapshot());
            }
            enabled = enabled_override.unwrap_or(slot.enabled);
        }

        let slot = Slot::new(Arc::new(manifest), enabled);
        self.store.save(&slot.persisted()).await?;

        let replaced = entries.contains_key(&id);
        let entry = PluginEntry::new(slot);
        let record = entry.snapshot();
        entries.insert(id.clone(), entry);

        if replaced {
            tracing::info!(plugin_id = %id, "Plugin re-registered with new manifest");
        } else {
            tracing::info!("Plugin registered: {}", id);
        }
        Ok(record)
    }

    pub async fn get(&self, id: &str) -> Result<PluginRecord> {
        self.entries
            .read()
            .await
            .get(id)
            .map(|e| e.snapshot())
            .ok_or_else(|| Error::not_found(id))
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.entries.read().await.contains_key(id)
    }

    /// All records, ordered by id.
    pub async fn list(&self) -> Vec<PluginRecord> {
        let mut records: Vec<_> = self
            .entries
            .read()
            .await
            .values()
            .map(|e| e.snapshot())
            .collect();
        records.sort_by(|a, b| a.manifest.id.cmp(&b.manifest.id));
        records
    }

    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.entries.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Remove an inactive record and its persisted copy.
    pub async fn remove(&self, id: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        let entry = entries.get(id).ok_or_else(|| Error::not_found(id))?;
        if entry.op_lock.try_lock().is_err() || entry.state().is_active() {
            return Err(Error::Conflict {
                id: id.to_string(),
                state: entry.state(),
            });
        }
        self.store.delete(id).await?;
        entries.remove(id);
        tracing::info!("Plugin removed: {}", id);
        Ok(())
    }

    /// Remove a record whose op lock the caller already holds.
    pub(crate) async fn remove_unchecked(&self, id: &str) -> Result<()> {
        self.store.delete(id).await?;
        self.entries.write().await.remove(id);
        Ok(())
    }

    pub(crate) async fn entry(&self, id: &str) -> Result<Arc<PluginEntry>> {
        self.entries
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found(id))
    }

    /// Write the entry's manifest and enabled flag to the store.
    pub(crate) async fn persist(&self, entry: &PluginEntry) -> Result<()> {
        let record = entry.slot.read().persisted();
        self.store.save(&record).await
    }

    /// Merge persisted records with freshly discovered manifests.
    ///
    /// Discovered content wins, but the last known enabled flag is kept.
    /// Persisted records with no discovered counterpart are restored from
    /// their stored manifest.
    pub async fn reconcile(&self, discovered: Vec<Manifest>) -> Result<ReconcileReport> {
        let persisted: HashMap<String, PersistedRecord> = self
            .store
            .load_all()
            .await?
            .into_iter()
            .map(|r| (r.manifest.id.clone(), r))
            .collect();

        let mut report = ReconcileReport::default();
        let mut seen = HashSet::new();

        for manifest in discovered {
            let id = manifest.id.clone();
            seen.insert(id.clone());
            let enabled = persisted.get(&id).map(|r| r.enabled);
            match self.register_with(manifest, enabled).await {
                Ok(_) => report.registered.push(id),
                Err(e) => {
                    tracing::warn!(plugin_id = %id, error = %e, "Discovered manifest not registered");
                    report.rejected.push((id, e));
                }
            }
        }

        let mut orphans: Vec<_> = persisted
            .into_values()
            .filter(|r| !seen.contains(&r.manifest.id))
            .collect();
        orphans.sort_by(|a, b| a.manifest.id.cmp(&b.manifest.id));

        for record in orphans {
            let id = record.manifest.id.clone();
            if self.contains(&id).await {
                continue;
            }
            match self.register_with(record.manifest, Some(record.enabled)).await {
                Ok(_) => {
                    tracing::info!(plugin_id = %id, "Restored persisted plugin record");
                    report.restored.push(id);
                }
                Err(e) => report.rejected.push((id, e)),
            }
        }

        Ok(report)
    }
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(id: &str, version: &str) -> Value {
        json!({
            "id": id,
            "name": id,
            "version": version,
            "author": "a",
            "description": "d",
            "plugin_type": "utility",
            "main_class": "noop",
            "api_version": "1.0"
        })
    }

    fn manifest(id: &str, version: &str) -> Manifest {
        ManifestValidator::validate(&raw(id, version)).unwrap()
    }

    fn force_state(registry: &PluginRegistry, id: &str, path: &[PluginState]) {
        let entries = registry.entries.try_read().unwrap();
        let mut slot = entries.get(id).unwrap().slot.write();
        for s in path {
            slot.machine.transition(*s, None).unwrap();
        }
    }

    #[tokio::test]
    async fn test_register_then_get() {
        let registry = PluginRegistry::in_memory();
        registry.register(manifest("p1", "1.0.0")).await.unwrap();

        let record = registry.get("p1").await.unwrap();
        assert_eq!(record.state, PluginState::Discovered);
        assert!(record.enabled);
        assert!(record.handle.is_none());
        assert!(record.last_error.is_none());
    }

    #[tokio::test]
    async fn test_invalid_manifest_not_registered() {
        let registry = PluginRegistry::in_memory();
        let mut bad = raw("p1", "1.0.0");
        bad.as_object_mut().unwrap().remove("author");

        let err = registry.register_raw(&bad).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(registry.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_conflict_over_active_record() {
        let registry = PluginRegistry::in_memory();
        registry.register(manifest("p1", "1.0.0")).await.unwrap();
        force_state(
            &registry,
            "p1",
            &[PluginState::Loaded, PluginState::Initialized, PluginState::Running],
        );

        let err = registry.register(manifest("p1", "1.0.0")).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Conflict {
                state: PluginState::Running,
                ..
            }
        ));
        let err = registry.register(manifest("p1", "2.0.0")).await.unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
        assert_eq!(registry.get("p1").await.unwrap().manifest.version.major, 1);
    }

    #[tokio::test]
    async fn test_idempotent_in_terminal_state() {
        let registry = PluginRegistry::in_memory();
        registry.register(manifest("p1", "1.0.0")).await.unwrap();
        force_state(&registry, "p1", &[PluginState::Disabled]);

        let record = registry.register(manifest("p1", "1.0.0")).await.unwrap();
        assert_eq!(record.state, PluginState::Disabled);
    }

    #[tokio::test]
    async fn test_replace_in_terminal_state_keeps_enabled() {
        let registry = PluginRegistry::in_memory();
        registry.register(manifest("p1", "1.0.0")).await.unwrap();
        {
            let entry = registry.entry("p1").await.unwrap();
            let mut slot = entry.slot.write();
            slot.machine.transition(PluginState::Error, None).unwrap();
            slot.enabled = false;
        }

        let record = registry.register(manifest("p1", "1.1.0")).await.unwrap();
        assert_eq!(record.state, PluginState::Discovered);
        assert_eq!(record.manifest.version.minor, 1);
        assert!(!record.enabled);
    }

    #[tokio::test]
    async fn test_remove() {
        let registry = PluginRegistry::in_memory();
        registry.register(manifest("p1", "1.0.0")).await.unwrap();
        registry.remove("p1").await.unwrap();
        assert!(matches!(registry.get("p1").await, Err(Error::NotFound(_))));
        assert!(matches!(registry.remove("p1").await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_list_sorted() {
        let registry = PluginRegistry::in_memory();
        for id in ["zeta", "alpha", "mid"] {
            registry.register(manifest(id, "1.0.0")).await.unwrap();
        }
        let ids: Vec<_> = registry.list().await.iter().map(|r| r.id().to_string()).collect();
        assert_eq!(ids, vec!["alpha", "mid", "zeta"]);
    }

    #[tokio::test]
    async fn test_reconcile_prefers_discovered_keeps_enabled() {
        let store = Arc::new(MemoryRecordStore::new());
        store
            .save(&PersistedRecord {
                manifest: manifest("p1", "1.0.0"),
                enabled: false,
                updated_at: Utc::now(),
            })
            .await
            .unwrap();
        store
            .save(&PersistedRecord {
                manifest: manifest("legacy", "0.1.0"),
                enabled: true,
                updated_at: Utc::now(),
            })
            .await
            .unwrap();

        let registry = PluginRegistry::new(store.clone());
        let report = registry
            .reconcile(vec![manifest("p1", "2.0.0"), manifest("p2", "1.0.0")])
            .await
            .unwrap();

        assert_eq!(report.registered, vec!["p1", "p2"]);
        assert_eq!(report.restored, vec!["legacy"]);

        let p1 = registry.get("p1").await.unwrap();
        assert_eq!(p1.manifest.version.major, 2);
        assert!(!p1.enabled);
        assert!(registry.get("p2").await.unwrap().enabled);

        let stored = store.load_all().await.unwrap();
        let p1_stored = stored.iter().find(|r| r.manifest.id == "p1").unwrap();
        assert_eq!(p1_stored.manifest.version.major, 2);
        assert!(!p1_stored.enabled);
    }
}
