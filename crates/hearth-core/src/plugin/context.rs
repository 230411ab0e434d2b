//! What a plugin instance is handed at `initialize`.
//!
//! A [`PluginSession`] exists per load of a plugin. Everything the instance
//! registers through its [`PluginContext`] is tracked by the session, so
//! teardown can remove all of it even when `initialize` failed halfway.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::manifest::Manifest;
use super::tasks::{TaskHandle, TaskSet, TaskShutdownReport};
use crate::config_store::PluginConfig;
use crate::error::{Error, Result};
use crate::hooks::{same_handler, HookBus, SharedHandler};
use crate::mediator::PluginMediator;

#[derive(Default)]
struct SessionHooks {
    closed: bool,
    entries: Vec<(String, SharedHandler)>,
}

/// Report from [`PluginSession::close`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionCloseReport {
    pub hooks_removed: usize,
    pub tasks: TaskShutdownReport,
}

/// Hook registrations and background tasks of one plugin load.
pub(crate) struct PluginSession {
    plugin_id: String,
    bus: Arc<HookBus>,
    hooks: Mutex<SessionHooks>,
    tasks: TaskSet,
}

impl PluginSession {
    pub(crate) fn new(plugin_id: impl Into<String>, bus: Arc<HookBus>) -> Arc<Self> {
        let plugin_id = plugin_id.into();
        Arc::new(Self {
            tasks: TaskSet::new(plugin_id.clone()),
            plugin_id,
            bus,
            hooks: Mutex::new(SessionHooks::default()),
        })
    }

    pub(crate) fn register_hook(&self, event: &str, handler: SharedHandler) -> Result<bool> {
        let mut hooks = self.hooks.lock();
        if hooks.closed {
            return Err(Error::NotSupported(format!(
                "plugin {} is not running; hook '{}' rejected",
                self.plugin_id, event
            )));
        }
        let added = self.bus.register(event, &self.plugin_id, handler.clone())?;
        if added {
            hooks.entries.push((event.to_string(), handler));
        }
        Ok(added)
    }

    pub(crate) fn unregister_hook(&self, event: &str, handler: &SharedHandler) -> bool {
        let mut hooks = self.hooks.lock();
        let Some(pos) = hooks
            .entries
            .iter()
            .position(|(e, h)| e == event && same_handler(h, handler))
        else {
            return false;
        };
        hooks.entries.remove(pos);
        self.bus.unregister(event, &self.plugin_id, handler)
    }

    /// Events with an active registration from this session.
    pub(crate) fn hook_events(&self) -> Vec<String> {
        let mut events: Vec<String> = self
            .hooks
            .lock()
            .entries
            .iter()
            .map(|(e, _)| e.clone())
            .collect();
        events.sort();
        events.dedup();
        events
    }

    pub(crate) fn hook_count(&self) -> usize {
        self.hooks.lock().entries.len()
    }

    pub(crate) fn task_names(&self) -> Vec<String> {
        self.tasks.active()
    }

    pub(crate) fn spawn<F, Fut>(&self, name: impl Into<String>, f: F) -> Result<TaskHandle>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.hooks.lock().closed {
            return Err(Error::NotSupported(format!(
                "plugin {} is not running",
                self.plugin_id
            )));
        }
        self.tasks.spawn(name, f)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.hooks.lock().closed
    }

    /// Stop accepting registrations, cancel tasks, then drop every hook.
    pub(crate) async fn close(&self, grace: Duration) -> SessionCloseReport {
        self.hooks.lock().closed = true;

        let tasks = self.tasks.shutdown(grace).await;

        let entries = std::mem::take(&mut self.hooks.lock().entries);
        let mut hooks_removed = 0;
        for (event, handler) in &entries {
            if self.bus.unregister(event, &self.plugin_id, handler) {
                hooks_removed += 1;
            }
        }

        SessionCloseReport {
            hooks_removed,
            tasks,
        }
    }
}

/// Capabilities available to a running plugin instance.
#[derive(Clone)]
pub struct PluginContext {
    session: Arc<PluginSession>,
    manifest: Arc<Manifest>,
    mediator: PluginMediator,
    config: PluginConfig,
}

impl PluginContext {
    pub(crate) fn new(
        session: Arc<PluginSession>,
        manifest: Arc<Manifest>,
        mediator: PluginMediator,
        config: PluginConfig,
    ) -> Self {
        Self {
            session,
            manifest,
            mediator,
            config,
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.manifest.id
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Subscribe to a hook event. Registrations are removed automatically
    /// when the plugin leaves `running`.
    pub fn register_hook(&self, event: &str, handler: SharedHandler) -> Result<bool> {
        if !self.manifest.hooks.iter().any(|h| h == event) {
            tracing::debug!(
                plugin_id = %self.manifest.id,
                event = %event,
                "Registering hook not listed in manifest"
            );
        }
        self.session.register_hook(event, handler)
    }

    pub fn unregister_hook(&self, event: &str, handler: &SharedHandler) -> bool {
        self.session.unregister_hook(event, handler)
    }

    /// Spawn a background task tracked under this plugin's id.
    pub fn spawn<F, Fut>(&self, name: impl Into<String>, f: F) -> Result<TaskHandle>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.session.spawn(name, f)
    }

    pub fn mediator(&self) -> &PluginMediator {
        &self.mediator
    }

    pub fn config(&self) -> &PluginConfig {
        &self.config
    }

    /// `false` once the plugin has been torn down.
    pub fn is_active(&self) -> bool {
        !self.session.is_closed()
    }
}

impl std::fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginContext")
            .field("plugin_id", &self.manifest.id)
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}
