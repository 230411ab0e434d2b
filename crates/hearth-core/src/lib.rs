//! Core of the Hearth plugin runtime.
//!
//! Discovers, validates, loads and supervises plugins that extend a host
//! application. Plugins reach host data only through the hook bus, the
//! resource mediator and their own configuration, gated by the permissions
//! their manifest declares.

pub mod config;
pub mod config_store;
pub mod discovery;
pub mod error;
pub mod hooks;
pub mod mediator;
pub mod permission;
pub mod plugin;
pub mod runtime;

pub use config::RuntimeConfig;
pub use error::{Error, Result};
pub use runtime::{BootSummary, PluginRuntime, RuntimeBuilder};

/// Re-exports commonly used types.
pub mod prelude {
    // Configuration
    pub use crate::config::{defaults, env_vars, RuntimeConfig};

    // Error handling
    pub use crate::error::{Error, Result};

    // Plugin model
    pub use crate::plugin::{
        ActionResponse, ConfigSchema, FailurePhase, LifecycleController, Manifest,
        ManifestValidator, Plugin, PluginCapabilities, PluginContext, PluginFactory,
        PluginFault, PluginRecord, PluginRegistry, PluginState, PluginType, PropertySchema,
        PropertyType,
    };

    // Hooks
    pub use crate::hooks::{hook_fn, DispatchReport, HookBus, HookError, HookEvent, HookHandler};

    // Host services
    pub use crate::config_store::{ConfigDocument, ConfigStore, PluginConfig};
    pub use crate::mediator::{
        capabilities, DeviceDataProvider, DeviceInfo, MediatorError, Notification,
        NotificationLevel, NotificationSink, PluginMediator, ProviderError, ResourceMediator,
    };
    pub use crate::permission::PermissionGuard;

    // Runtime
    pub use crate::runtime::{PluginRuntime, RuntimeBuilder};
}
