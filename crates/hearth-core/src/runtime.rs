//! The runtime context object.
//!
//! A [`PluginRuntime`] owns one instance of every component and wires them
//! together. The host builds it once at startup and passes it around
//! explicitly; nothing in this crate is global.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::config::RuntimeConfig;
use crate::config_store::{ConfigPersistence, ConfigStore, MemoryConfigPersistence};
use crate::discovery::{self, DiscoveryReport};
use crate::error::Result;
use crate::hooks::{DispatchReport, HookBus, SharedHandler, HOST_OWNER};
use crate::mediator::{DeviceDataProvider, NotificationSink, ResourceMediator};
use crate::permission::PermissionGuard;
use crate::plugin::factory::PluginFactory;
use crate::plugin::lifecycle::{BootReport, LifecycleController, LifecycleSettings, SupervisorHandle};
use crate::plugin::loader::PluginLoader;
use crate::plugin::manifest::Manifest;
use crate::plugin::registry::{MemoryRecordStore, PluginRecord, PluginRegistry, ReconcileReport, RecordStore};

/// Builder for [`PluginRuntime`].
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    factory: PluginFactory,
    devices: Option<Arc<dyn DeviceDataProvider>>,
    notifications: Option<Arc<dyn NotificationSink>>,
    records: Option<Arc<dyn RecordStore>>,
    configs: Option<Arc<dyn ConfigPersistence>>,
}

impl RuntimeBuilder {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            factory: PluginFactory::new(),
            devices: None,
            notifications: None,
            records: None,
            configs: None,
        }
    }

    /// Constructors for `main_class` values.
    pub fn factory(mut self, factory: PluginFactory) -> Self {
        self.factory = factory;
        self
    }

    pub fn devices(mut self, provider: Arc<dyn DeviceDataProvider>) -> Self {
        self.devices = Some(provider);
        self
    }

    pub fn notifications(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.notifications = Some(sink);
        self
    }

    /// Durable registry records. Defaults to memory.
    pub fn record_store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.records = Some(store);
        self
    }

    /// Durable plugin configuration. Defaults to memory.
    pub fn config_persistence(mut self, persistence: Arc<dyn ConfigPersistence>) -> Self {
        self.configs = Some(persistence);
        self
    }

    /// Wire the components and start the lifecycle supervisor.
    ///
    /// Must be called inside a tokio runtime.
    pub fn build(self) -> Result<PluginRuntime> {
        let loader = PluginLoader::new(self.factory, &self.config.host_version, &self.config.api_version)?;

        let hooks = Arc::new(HookBus::new(self.config.hook_timeout()));
        let guard = Arc::new(PermissionGuard::new());
        let registry = Arc::new(PluginRegistry::new(
            self.records
                .unwrap_or_else(|| Arc::new(MemoryRecordStore::new())),
        ));
        let config_store = Arc::new(ConfigStore::new(
            self.configs
                .unwrap_or_else(|| Arc::new(MemoryConfigPersistence::new())),
        ));

        let (fault_tx, fault_rx) = mpsc::unbounded_channel();
        let mut mediator = ResourceMediator::new(guard.clone(), hooks.clone()).with_fault_channel(fault_tx);
        if let Some(devices) = self.devices {
            mediator = mediator.with_devices(devices);
        }
        if let Some(sink) = self.notifications {
            mediator = mediator.with_notifications(sink);
        }
        let mediator = Arc::new(mediator);

        let controller = Arc::new(LifecycleController::new(
            registry.clone(),
            loader,
            hooks.clone(),
            guard.clone(),
            config_store.clone(),
            mediator.clone(),
            LifecycleSettings::from(&self.config),
        ));
        let supervisor = controller.spawn_supervisor(Some(fault_rx));

        tracing::info!(
            host_version = %self.config.host_version,
            api_version = %self.config.api_version,
            plugin_dirs = self.config.plugin_dirs.len(),
            "Plugin runtime ready"
        );

        Ok(PluginRuntime {
            config: self.config,
            registry,
            controller,
            hooks,
            config_store,
            guard,
            mediator,
            supervisor: Mutex::new(Some(supervisor)),
        })
    }
}

/// Result of [`PluginRuntime::boot`].
#[derive(Debug, Default)]
pub struct BootSummary {
    pub discovery: DiscoveryReport,
    pub reconcile: ReconcileReport,
    pub boot: BootReport,
}

/// The plugin runtime.
pub struct PluginRuntime {
    config: RuntimeConfig,
    registry: Arc<PluginRegistry>,
    controller: Arc<LifecycleController>,
    hooks: Arc<HookBus>,
    config_store: Arc<ConfigStore>,
    guard: Arc<PermissionGuard>,
    mediator: Arc<ResourceMediator>,
    supervisor: Mutex<Option<SupervisorHandle>>,
}

impl PluginRuntime {
    pub fn builder(config: RuntimeConfig) -> RuntimeBuilder {
        RuntimeBuilder::new(config)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    pub fn controller(&self) -> &Arc<LifecycleController> {
        &self.controller
    }

    pub fn hooks(&self) -> &Arc<HookBus> {
        &self.hooks
    }

    pub fn config_store(&self) -> &Arc<ConfigStore> {
        &self.config_store
    }

    pub fn guard(&self) -> &Arc<PermissionGuard> {
        &self.guard
    }

    pub fn mediator(&self) -> &Arc<ResourceMediator> {
        &self.mediator
    }

    pub async fn register(&self, manifest: Manifest) -> Result<PluginRecord> {
        self.controller.register(manifest).await
    }

    pub async fn register_raw(&self, raw: &Value) -> Result<PluginRecord> {
        self.controller.register_raw(raw).await
    }

    /// Scan the configured plugin directories.
    pub fn discover(&self) -> DiscoveryReport {
        discovery::discover(&self.config.plugin_dirs)
    }

    /// Discover, reconcile with persisted records, then start every enabled
    /// plugin.
    pub async fn boot(&self) -> Result<BootSummary> {
        let discovery = self.discover();
        let reconcile = self.controller.reconcile(discovery.manifests()).await?;
        let boot = self.controller.start_enabled().await;
        Ok(BootSummary {
            discovery,
            reconcile,
            boot,
        })
    }

    /// Subscribe a host-owned handler. Host handlers are never subject to
    /// plugin failure policy.
    pub fn register_hook(&self, event: &str, handler: SharedHandler) -> Result<bool> {
        self.hooks.register(event, HOST_OWNER, handler)
    }

    /// Emit an event as the host. Any namespace is allowed.
    pub async fn emit(&self, event: &str, payload: Value) -> DispatchReport {
        self.hooks.emit(event, payload).await
    }

    /// Tear down every active plugin, then stop the supervisor. Persisted
    /// enabled flags are left as they were.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down plugin runtime");
        self.controller.shutdown_all().await;
        let supervisor = self.supervisor.lock().take();
        if let Some(supervisor) = supervisor {
            supervisor.stop().await;
        }
    }
}

impl std::fmt::Debug for PluginRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRuntime")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
