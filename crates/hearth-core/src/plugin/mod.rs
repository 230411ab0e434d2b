//! Plugin model: manifests, records, instances and their lifecycle.

pub mod context;
pub mod factory;
pub mod instance;
pub mod lifecycle;
pub mod loader;
pub mod manifest;
pub mod registry;
pub mod schema;
pub mod state;
pub mod tasks;

pub use context::{PluginContext, SessionCloseReport};
pub use factory::{PluginConstructor, PluginFactory};
pub use instance::{
    ActionResponse, ActionStatus, DynPlugin, InstanceHandle, Plugin, PluginCapabilities,
    PluginFault,
};
pub use lifecycle::{
    events, BootReport, FailurePhase, FailureRecord, LifecycleController, LifecycleSettings,
    SupervisorHandle,
};
pub use loader::PluginLoader;
pub use manifest::{
    is_valid_identifier, is_valid_plugin_id, parse_version, FieldProblem, Manifest,
    ManifestValidator, PluginType, ValidationError,
};
pub use registry::{
    MemoryRecordStore, PersistedRecord, PluginRecord, PluginRegistry, ReconcileReport,
    RecordStore,
};
pub use schema::{ConfigSchema, PropertySchema, PropertyType};
pub use state::{PluginState, StateMachine, StateTransition, TransitionError};
pub use tasks::{TaskHandle, TaskSet, TaskShutdownReport};
