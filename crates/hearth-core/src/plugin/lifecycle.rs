//! Lifecycle controller.
//!
//! Drives every plugin through
//! `discovered -> loaded -> initialized -> running`, with `error` and
//! `disabled` as the exits. All record mutations happen here, under the
//! entry's operation lock. Lifecycle announcements (`plugin.*` hooks) are
//! emitted only after that lock is released, so a handler may call back into
//! the controller for the same id.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::context::{PluginContext, PluginSession};
use super::factory::panic_message;
use super::instance::{ActionResponse, InstanceHandle, PluginCapabilities};
use super::loader::PluginLoader;
use super::manifest::Manifest;
use super::registry::{PluginEntry, PluginRecord, PluginRegistry, ReconcileReport};
use super::state::PluginState;
use crate::config::RuntimeConfig;
use crate::config_store::{ConfigStore, PluginConfig};
use crate::error::{Error, Result};
use crate::hooks::{HookBus, HookFailure, HookFailureKind, HOST_OWNER};
use crate::mediator::{MediatorFault, PluginMediator, ResourceMediator};
use crate::permission::PermissionGuard;

/// Host hook events announcing lifecycle changes.
pub mod events {
    pub const LOADED: &str = "plugin.loaded";
    pub const STARTED: &str = "plugin.started";
    pub const DISABLED: &str = "plugin.disabled";
    pub const ERROR: &str = "plugin.error";
    pub const UNINSTALLED: &str = "plugin.uninstalled";
}

const MAX_FAILURE_RECORDS: usize = 1000;

/// Where a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePhase {
    Load,
    Dependency,
    Initialize,
    Shutdown,
    Hook,
    Mediator,
    Teardown,
}

impl FailurePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailurePhase::Load => "load",
            FailurePhase::Dependency => "dependency",
            FailurePhase::Initialize => "initialize",
            FailurePhase::Shutdown => "shutdown",
            FailurePhase::Hook => "hook",
            FailurePhase::Mediator => "mediator",
            FailurePhase::Teardown => "teardown",
        }
    }
}

/// Structured failure entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub plugin_id: String,
    pub phase: FailurePhase,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Timing and policy knobs, taken from [`RuntimeConfig`].
#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub init_timeout: Duration,
    pub shutdown_grace: Duration,
    pub hook_failure_threshold: Option<u32>,
    pub hook_failure_window: Duration,
}

impl From<&RuntimeConfig> for LifecycleSettings {
    fn from(config: &RuntimeConfig) -> Self {
        Self {
            init_timeout: config.init_timeout(),
            shutdown_grace: config.shutdown_grace(),
            hook_failure_threshold: config.hook_failure_threshold,
            hook_failure_window: config.hook_failure_window(),
        }
    }
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self::from(&RuntimeConfig::default())
    }
}

/// Result of [`LifecycleController::start_enabled`].
#[derive(Debug, Default)]
pub struct BootReport {
    pub started: Vec<String>,
    pub failed: Vec<(String, Error)>,
    /// Registered but not enabled.
    pub skipped: Vec<String>,
}

struct Announcement {
    event: &'static str,
    payload: Value,
}

type Pending = Vec<Announcement>;

/// Handle to the background supervisor.
pub struct SupervisorHandle {
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl SupervisorHandle {
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.join.await {
            warn!("Lifecycle supervisor ended abnormally: {}", e);
        }
    }
}

/// Drives plugin state and owns teardown.
pub struct LifecycleController {
    registry: Arc<PluginRegistry>,
    loader: PluginLoader,
    hooks: Arc<HookBus>,
    guard: Arc<PermissionGuard>,
    config: Arc<ConfigStore>,
    mediator: Arc<ResourceMediator>,
    settings: LifecycleSettings,
    journal: Mutex<VecDeque<FailureRecord>>,
}

impl LifecycleController {
    pub fn new(
        registry: Arc<PluginRegistry>,
        loader: PluginLoader,
        hooks: Arc<HookBus>,
        guard: Arc<PermissionGuard>,
        config: Arc<ConfigStore>,
        mediator: Arc<ResourceMediator>,
        settings: LifecycleSettings,
    ) -> Self {
        Self {
            registry,
            loader,
            hooks,
            guard,
            config,
            mediator,
            settings,
            journal: Mutex::new(VecDeque::new()),
        }
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> &LifecycleSettings {
        &self.settings
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Register a validated manifest and attach its config schema.
    pub async fn register(&self, manifest: Manifest) -> Result<PluginRecord> {
        let id = manifest.id.clone();
        let schema = manifest.config_schema.clone();
        let record = self.registry.register(manifest).await?;
        self.config.register_schema(&id, schema).await;
        Ok(record)
    }

    /// Validate raw manifest data, then register it.
    pub async fn register_raw(&self, raw: &Value) -> Result<PluginRecord> {
        let manifest = super::manifest::ManifestValidator::validate(raw)?;
        self.register(manifest).await
    }

    /// Reconcile persisted records with discovered manifests.
    pub async fn reconcile(&self, discovered: Vec<Manifest>) -> Result<ReconcileReport> {
        let report = self.registry.reconcile(discovered).await?;
        for record in self.registry.list().await {
            self.config
                .register_schema(record.id(), record.manifest.config_schema.clone())
                .await;
        }
        Ok(report)
    }

    // ========================================================================
    // Transitions
    // ========================================================================

    /// `discovered -> loaded` (also from `disabled` and `error`).
    pub async fn load(&self, id: &str) -> Result<PluginRecord> {
        let entry = self.registry.entry(id).await?;
        let mut pending = Vec::new();
        let result = {
            let _op = entry.op_lock.lock().await;
            self.load_locked(&entry, &mut pending).await
        };
        self.finish(&entry, pending, result).await
    }

    /// `loaded -> initialized -> running`.
    pub async fn start(&self, id: &str) -> Result<PluginRecord> {
        let entry = self.registry.entry(id).await?;
        let mut pending = Vec::new();
        let result = {
            let _op = entry.op_lock.lock().await;
            self.start_locked(&entry, &mut pending).await
        };
        self.finish(&entry, pending, result).await
    }

    /// Load if needed, then start.
    pub async fn activate(&self, id: &str) -> Result<PluginRecord> {
        let entry = self.registry.entry(id).await?;
        let mut pending = Vec::new();
        let result = {
            let _op = entry.op_lock.lock().await;
            self.activate_locked(&entry, &mut pending).await
        };
        self.finish(&entry, pending, result).await
    }

    /// Tear down and move to `disabled`; the plugin stays disabled across restarts.
    pub async fn disable(&self, id: &str) -> Result<PluginRecord> {
        let entry = self.registry.entry(id).await?;
        let mut pending = Vec::new();
        let result = {
            let _op = entry.op_lock.lock().await;
            match self.disable_locked(&entry, &mut pending).await {
                Ok(()) => {
                    entry.slot.write().enabled = false;
                    self.registry.persist(&entry).await
                }
                Err(e) => Err(e),
            }
        };
        self.finish(&entry, pending, result).await
    }

    /// Mark enabled and bring the plugin to `running`.
    pub async fn enable(&self, id: &str) -> Result<PluginRecord> {
        let entry = self.registry.entry(id).await?;
        let mut pending = Vec::new();
        let result = {
            let _op = entry.op_lock.lock().await;
            entry.slot.write().enabled = true;
            match self.registry.persist(&entry).await {
                Ok(()) => self.activate_locked(&entry, &mut pending).await,
                Err(e) => Err(e),
            }
        };
        self.finish(&entry, pending, result).await
    }

    /// `error -> loaded`, then `running` when the plugin is enabled.
    pub async fn reload(&self, id: &str) -> Result<PluginRecord> {
        let entry = self.registry.entry(id).await?;
        let mut pending = Vec::new();
        let result = {
            let _op = entry.op_lock.lock().await;
            self.reload_locked(&entry, &mut pending).await
        };
        self.finish(&entry, pending, result).await
    }

    /// Move an active plugin to `error` after an unrecoverable failure.
    ///
    /// A plugin already in `error` keeps its state; the message and its latest
    /// failure record are overwritten. Inactive plugins are left alone.
    pub async fn report_fatal(
        &self,
        id: &str,
        phase: FailurePhase,
        message: impl Into<String>,
    ) -> Result<PluginRecord> {
        let message = message.into();
        let entry = self.registry.entry(id).await?;
        let mut pending = Vec::new();
        {
            let _op = entry.op_lock.lock().await;
            let state = entry.state();
            if state.is_active() {
                self.teardown_locked(&entry, true).await;
                self.fail_locked(&entry, phase, message, &mut pending);
            } else if state == PluginState::Error {
                self.fail_locked(&entry, phase, message, &mut pending);
            } else {
                debug!(plugin_id = %id, state = %state, "Ignoring fault for inactive plugin");
            }
        }
        self.finish(&entry, pending, Ok(())).await
    }

    /// Tear down and remove the record, its configuration and its grant.
    pub async fn uninstall(&self, id: &str) -> Result<()> {
        let entry = self.registry.entry(id).await?;
        {
            let _op = entry.op_lock.lock().await;
            if entry.state().is_active() {
                self.teardown_locked(&entry, true).await;
            }
            self.registry.remove_unchecked(id).await?;
            self.config.forget(id).await?;
            self.guard.revoke(id);
        }
        info!("Plugin uninstalled: {}", id);
        self.announce(vec![Announcement {
            event: events::UNINSTALLED,
            payload: json!({ "plugin_id": id }),
        }])
        .await;
        Ok(())
    }

    // ========================================================================
    // Optional capabilities
    // ========================================================================

    fn running_handle(&self, record: &PluginRecord) -> Result<InstanceHandle> {
        match (&record.state, &record.handle) {
            (PluginState::Running, Some(handle)) => Ok(handle.clone()),
            _ => Err(Error::NotSupported(format!(
                "plugin {} is {}",
                record.id(),
                record.state
            ))),
        }
    }

    /// `get_status()` of a running plugin that declares it.
    pub async fn status(&self, id: &str) -> Result<Map<String, Value>> {
        let record = self.registry.get(id).await?;
        let handle = self.running_handle(&record)?;
        if !handle.capabilities().contains(PluginCapabilities::STATUS) {
            return Err(Error::NotSupported(format!(
                "plugin {} does not report status",
                id
            )));
        }
        AssertUnwindSafe(handle.instance().get_status())
            .catch_unwind()
            .await
            .map_err(|p| {
                Error::NotSupported(format!("get_status panicked: {}", panic_message(p.as_ref())))
            })
    }

    /// `handle_action()` of a running plugin that declares it.
    pub async fn handle_action(&self, id: &str, action: &str, params: &Value) -> Result<ActionResponse> {
        let record = self.registry.get(id).await?;
        let handle = self.running_handle(&record)?;
        if !handle.capabilities().contains(PluginCapabilities::ACTIONS) {
            return Err(Error::NotSupported(format!(
                "plugin {} does not handle actions",
                id
            )));
        }
        let response = AssertUnwindSafe(handle.instance().handle_action(action, params))
            .catch_unwind()
            .await
            .unwrap_or_else(|p| {
                warn!(plugin_id = %id, action = %action, "Action handler panicked");
                ActionResponse::error(format!("action panicked: {}", panic_message(p.as_ref())))
            });
        Ok(response)
    }

    // ========================================================================
    // Host startup and shutdown
    // ========================================================================

    /// Load and start every enabled plugin whose dependencies can be
    /// satisfied, dependencies first. Plugins left over after no more
    /// progress is possible are attempted once so their failure is recorded.
    pub async fn start_enabled(&self) -> BootReport {
        let mut report = BootReport::default();
        let mut pending: Vec<PluginRecord> = Vec::new();

        for record in self.registry.list().await {
            if !record.enabled {
                report.skipped.push(record.id().to_string());
            } else if record.state != PluginState::Running {
                pending.push(record);
            }
        }

        loop {
            let mut progressed = false;
            let mut still_pending = Vec::new();
            for record in pending {
                let ready = self.dependencies_running(&record.manifest).await;
                if !ready {
                    still_pending.push(record);
                    continue;
                }
                progressed = true;
                match self.activate(record.id()).await {
                    Ok(_) => report.started.push(record.id().to_string()),
                    Err(e) => report.failed.push((record.id().to_string(), e)),
                }
            }
            pending = still_pending;
            if !progressed || pending.is_empty() {
                break;
            }
        }

        for record in pending {
            match self.activate(record.id()).await {
                Ok(_) => report.started.push(record.id().to_string()),
                Err(e) => report.failed.push((record.id().to_string(), e)),
            }
        }

        info!(
            started = report.started.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            "Enabled plugins started"
        );
        report
    }

    async fn dependencies_running(&self, manifest: &Manifest) -> bool {
        for dep in &manifest.dependencies {
            match self.registry.get(dep).await {
                Ok(r) if r.state == PluginState::Running => {}
                _ => return false,
            }
        }
        true
    }

    /// Tear down every active plugin, dependents first. Enabled flags are
    /// left untouched so the same set starts on the next boot.
    pub async fn shutdown_all(&self) {
        let active: Vec<PluginRecord> = self
            .registry
            .list()
            .await
            .into_iter()
            .filter(|r| r.state.is_active())
            .collect();

        for id in teardown_order(&active) {
            let entry = match self.registry.entry(&id).await {
                Ok(entry) => entry,
                Err(_) => continue,
            };
            let mut pending = Vec::new();
            let result = {
                let _op = entry.op_lock.lock().await;
                self.disable_locked(&entry, &mut pending).await
            };
            if let Err(e) = self.finish(&entry, pending, result).await {
                warn!(plugin_id = %id, error = %e, "Plugin teardown during shutdown failed");
            }
        }
    }

    // ========================================================================
    // Failure journal and supervision
    // ========================================================================

    /// Every captured failure, oldest first.
    pub fn failures(&self) -> Vec<FailureRecord> {
        self.journal.lock().iter().cloned().collect()
    }

    pub fn failures_for(&self, id: &str) -> Vec<FailureRecord> {
        self.journal
            .lock()
            .iter()
            .filter(|r| r.plugin_id == id)
            .cloned()
            .collect()
    }

    fn record_failure(&self, plugin_id: &str, phase: FailurePhase, message: &str, overwrite: bool) {
        let record = FailureRecord {
            plugin_id: plugin_id.to_string(),
            phase,
            message: message.to_string(),
            at: Utc::now(),
        };
        let mut journal = self.journal.lock();
        if overwrite {
            if let Some(last) = journal.iter_mut().rev().find(|r| r.plugin_id == plugin_id) {
                *last = record;
                return;
            }
        }
        journal.push_back(record);
        while journal.len() > MAX_FAILURE_RECORDS {
            journal.pop_front();
        }
    }

    /// Watch hook failures and mediator faults, moving plugins to `error`
    /// according to policy.
    pub fn spawn_supervisor(
        self: &Arc<Self>,
        faults: Option<mpsc::UnboundedReceiver<MediatorFault>>,
    ) -> SupervisorHandle {
        let token = CancellationToken::new();
        let this = Arc::clone(self);
        let cancel = token.child_token();
        let mut failures = self.hooks.subscribe_failures();

        let join = tokio::spawn(async move {
            let mut windows: HashMap<String, VecDeque<tokio::time::Instant>> = HashMap::new();
            let mut faults = faults;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    failure = failures.recv() => match failure {
                        Ok(failure) => {
                            if let Some(reason) = this.hook_failure_reason(&failure, &mut windows) {
                                this.spawn_fatal(failure.plugin_id, FailurePhase::Hook, reason);
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(skipped = n, "Supervisor lagged behind hook failures");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    fault = recv_fault(&mut faults) => match fault {
                        Some(fault) => this.spawn_fatal(fault.plugin_id, FailurePhase::Mediator, fault.message),
                        None => faults = None,
                    },
                }
            }
            debug!("Lifecycle supervisor stopped");
        });

        SupervisorHandle { token, join }
    }

    /// Applied on its own task so the loop never waits on a plugin's op lock.
    fn spawn_fatal(self: &Arc<Self>, plugin_id: String, phase: FailurePhase, reason: String) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.report_fatal(&plugin_id, phase, reason).await {
                debug!(plugin_id = %plugin_id, phase = phase.as_str(), error = %e, "Fault not applied");
            }
        });
    }

    /// Fatal failures yield a reason at once; others count toward the
    /// threshold inside the sliding window.
    fn hook_failure_reason(
        &self,
        failure: &HookFailure,
        windows: &mut HashMap<String, VecDeque<tokio::time::Instant>>,
    ) -> Option<String> {
        if failure.plugin_id == HOST_OWNER {
            return None;
        }

        if failure.kind == HookFailureKind::Fatal {
            return Some(format!(
                "hook handler '{}' on {} failed fatally: {}",
                failure.handler, failure.event, failure.message
            ));
        }

        let threshold = self.settings.hook_failure_threshold?;
        let now = tokio::time::Instant::now();
        let window = windows.entry(failure.plugin_id.clone()).or_default();
        window.push_back(now);
        while let Some(oldest) = window.front() {
            if now.duration_since(*oldest) > self.settings.hook_failure_window {
                window.pop_front();
            } else {
                break;
            }
        }
        if (window.len() as u32) < threshold {
            return None;
        }

        let count = window.len();
        window.clear();
        Some(format!(
            "{} hook handler failures within {}s; last on {}: {}",
            count,
            self.settings.hook_failure_window.as_secs(),
            failure.event,
            failure.message
        ))
    }

    // ========================================================================
    // Internals (caller holds the entry's op lock)
    // ========================================================================

    /// Snapshot the record, then announce with the op lock released.
    async fn finish(
        &self,
        entry: &PluginEntry,
        pending: Pending,
        result: Result<()>,
    ) -> Result<PluginRecord> {
        let record = entry.snapshot();
        self.announce(pending).await;
        result.map(|_| record)
    }

    fn transition(&self, entry: &PluginEntry, to: PluginState, reason: Option<String>) -> Result<()> {
        let mut slot = entry.slot.write();
        let from = slot.state();
        slot.machine
            .transition(to, reason)
            .map_err(|e| Error::InvalidTransition {
                plugin: slot.manifest.id.clone(),
                from: e.from,
                to: e.to,
            })?;
        info!(plugin_id = %slot.manifest.id, from = %from, to = %to, "Plugin state changed");
        Ok(())
    }

    async fn reload_locked(&self, entry: &PluginEntry, pending: &mut Pending) -> Result<()> {
        let (id, state) = {
            let slot = entry.slot.read();
            (slot.manifest.id.clone(), slot.state())
        };
        if state != PluginState::Error {
            return Err(Error::InvalidTransition {
                plugin: id,
                from: state,
                to: PluginState::Loaded,
            });
        }
        info!(plugin_id = %id, "Reloading plugin");
        self.load_locked(entry, pending).await?;
        let enabled = entry.slot.read().enabled;
        if enabled {
            self.start_locked(entry, pending).await?;
        }
        Ok(())
    }

    async fn activate_locked(&self, entry: &PluginEntry, pending: &mut Pending) -> Result<()> {
        let state = entry.state();
        if state == PluginState::Running {
            return Ok(());
        }
        if state != PluginState::Loaded {
            self.load_locked(entry, pending).await?;
        }
        self.start_locked(entry, pending).await
    }

    async fn load_locked(&self, entry: &PluginEntry, pending: &mut Pending) -> Result<()> {
        let (manifest, state) = {
            let slot = entry.slot.read();
            (slot.manifest.clone(), slot.state())
        };
        let id = manifest.id.clone();

        if !state.can_transition_to(PluginState::Loaded) {
            return Err(Error::InvalidTransition {
                plugin: id,
                from: state,
                to: PluginState::Loaded,
            });
        }

        // leftovers from a previous load
        self.teardown_locked(entry, false).await;

        let instance = match self.loader.load(&manifest, &self.registry).await {
            Ok(instance) => instance,
            Err(e) => {
                let phase = if matches!(e, Error::Dependency { .. }) {
                    FailurePhase::Dependency
                } else {
                    FailurePhase::Load
                };
                self.fail_locked(entry, phase, e.to_string(), pending);
                return Err(e);
            }
        };

        self.guard.grant(&id, manifest.permissions.iter().cloned());
        {
            let mut slot = entry.slot.write();
            slot.handle = Some(InstanceHandle::new(instance));
            slot.session = Some(PluginSession::new(id.clone(), self.hooks.clone()));
        }
        self.transition(entry, PluginState::Loaded, None)?;

        pending.push(Announcement {
            event: events::LOADED,
            payload: json!({ "plugin_id": id, "version": manifest.version.to_string() }),
        });
        Ok(())
    }

    async fn start_locked(&self, entry: &PluginEntry, pending: &mut Pending) -> Result<()> {
        let (manifest, state, handle, session) = {
            let slot = entry.slot.read();
            (
                slot.manifest.clone(),
                slot.state(),
                slot.handle.clone(),
                slot.session.clone(),
            )
        };
        let id = manifest.id.clone();

        if state != PluginState::Loaded {
            return Err(Error::InvalidTransition {
                plugin: id,
                from: state,
                to: PluginState::Initialized,
            });
        }

        let (handle, session) = match (handle, session) {
            (Some(h), Some(s)) => (h, s),
            _ => {
                let cause = "no instance loaded".to_string();
                self.fail_locked(entry, FailurePhase::Initialize, cause.clone(), pending);
                return Err(Error::initialization(id, cause));
            }
        };

        let ctx = PluginContext::new(
            session,
            manifest.clone(),
            PluginMediator::new(self.mediator.clone(), id.clone()),
            PluginConfig::new(self.config.clone(), id.clone()),
        );

        let init = AssertUnwindSafe(handle.instance().initialize(ctx)).catch_unwind();
        let cause = match tokio::time::timeout(self.settings.init_timeout, init).await {
            Ok(Ok(Ok(true))) => None,
            Ok(Ok(Ok(false))) => Some("initialize returned false".to_string()),
            Ok(Ok(Err(fault))) => Some(fault.to_string()),
            Ok(Err(panic)) => Some(format!("initialize panicked: {}", panic_message(panic.as_ref()))),
            Err(_) => Some(format!(
                "initialize timed out after {}ms",
                self.settings.init_timeout.as_millis()
            )),
        };

        if let Some(cause) = cause {
            self.teardown_locked(entry, false).await;
            self.fail_locked(entry, FailurePhase::Initialize, cause.clone(), pending);
            return Err(Error::initialization(id, cause));
        }

        self.transition(entry, PluginState::Initialized, None)?;
        self.transition(entry, PluginState::Running, None)?;
        entry.slot.write().last_error = None;

        pending.push(Announcement {
            event: events::STARTED,
            payload: json!({ "plugin_id": id }),
        });
        Ok(())
    }

    async fn disable_locked(&self, entry: &PluginEntry, pending: &mut Pending) -> Result<()> {
        let state = entry.state();
        if state == PluginState::Disabled {
            return Ok(());
        }
        self.teardown_locked(entry, state.is_active()).await;
        self.transition(entry, PluginState::Disabled, Some("disabled".to_string()))?;
        let id = entry.slot.read().manifest.id.clone();
        pending.push(Announcement {
            event: events::DISABLED,
            payload: json!({ "plugin_id": id }),
        });
        Ok(())
    }

    /// Shutdown (optional), cancel tasks, drop hooks, revoke the grant and
    /// release the instance. Never fails; problems are journaled.
    async fn teardown_locked(&self, entry: &PluginEntry, invoke_shutdown: bool) {
        let (id, handle, session) = {
            let mut slot = entry.slot.write();
            (
                slot.manifest.id.clone(),
                slot.handle.take(),
                slot.session.take(),
            )
        };
        let grace = self.settings.shutdown_grace;

        if let (true, Some(handle)) = (invoke_shutdown, &handle) {
            let shutdown = AssertUnwindSafe(handle.instance().shutdown()).catch_unwind();
            let problem = match tokio::time::timeout(grace, shutdown).await {
                Ok(Ok(Ok(()))) => None,
                Ok(Ok(Err(fault))) => Some(format!("shutdown failed: {}", fault)),
                Ok(Err(panic)) => Some(format!("shutdown panicked: {}", panic_message(panic.as_ref()))),
                Err(_) => Some(format!("shutdown timed out after {}ms", grace.as_millis())),
            };
            if let Some(message) = problem {
                warn!(plugin_id = %id, "{}", message);
                self.record_failure(&id, FailurePhase::Shutdown, &message, false);
            }
        }

        if let Some(session) = session {
            let report = session.close(grace).await;
            if !report.tasks.abandoned.is_empty() {
                let message = format!(
                    "abandoned background tasks after {}ms: {}",
                    grace.as_millis(),
                    report.tasks.abandoned.join(", ")
                );
                warn!(plugin_id = %id, "{}", message);
                self.record_failure(&id, FailurePhase::Teardown, &message, false);
            }
        }

        let leftover = self.hooks.unregister_plugin(&id);
        if leftover > 0 {
            warn!(plugin_id = %id, leftover, "Purged hook registrations outside the plugin session");
        }
        self.guard.revoke(&id);
    }

    fn fail_locked(&self, entry: &PluginEntry, phase: FailurePhase, cause: String, pending: &mut Pending) {
        let (id, was_error) = {
            let mut slot = entry.slot.write();
            let id = slot.manifest.id.clone();
            let from = slot.state();
            let was_error = from == PluginState::Error;
            if !was_error {
                match slot.machine.transition(PluginState::Error, Some(cause.clone())) {
                    Ok(()) => info!(plugin_id = %id, from = %from, to = "error", "Plugin state changed"),
                    Err(e) => error!(plugin_id = %id, "Cannot enter error state: {}", e),
                }
            }
            slot.last_error = Some(cause.clone());
            (id, was_error)
        };

        error!(plugin_id = %id, phase = phase.as_str(), "Plugin failed: {}", cause);
        self.record_failure(&id, phase, &cause, was_error);
        pending.push(Announcement {
            event: events::ERROR,
            payload: json!({ "plugin_id": id, "phase": phase.as_str(), "message": cause }),
        });
    }

    async fn announce(&self, pending: Pending) {
        for a in pending {
            let report = self.hooks.emit(a.event, a.payload).await;
            if !report.all_ok() {
                debug!(
                    event = a.event,
                    failures = report.failure_count(),
                    "Lifecycle announcement had handler failures"
                );
            }
        }
    }
}

async fn recv_fault(
    faults: &mut Option<mpsc::UnboundedReceiver<MediatorFault>>,
) -> Option<MediatorFault> {
    match faults {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Dependents before their dependencies.
fn teardown_order(active: &[PluginRecord]) -> Vec<String> {
    let mut remaining: Vec<&PluginRecord> = active.iter().collect();
    let mut order = Vec::with_capacity(active.len());

    while !remaining.is_empty() {
        let (ready, blocked): (Vec<&PluginRecord>, Vec<&PluginRecord>) =
            remaining.iter().copied().partition(|candidate| {
                !remaining.iter().any(|other| {
                    other.id() != candidate.id()
                        && other.manifest.dependencies.iter().any(|d| d == candidate.id())
                })
            });

        if ready.is_empty() {
            // dependency cycle among active plugins
            order.extend(blocked.iter().map(|r| r.id().to_string()));
            break;
        }
        order.extend(ready.iter().map(|r| r.id().to_string()));
        remaining = blocked;
    }
    order
}
