//! Unified error handling for the plugin runtime.
//!
//! Lifecycle failures (load, init, dependency) are returned to the caller *and*
//! recorded on the plugin record, so the host can always inspect them after the
//! fact. Hook handler failures and shutdown overruns never surface here; they are
//! captured as [`crate::hooks::HookFailure`] and
//! [`crate::plugin::lifecycle::FailureRecord`] values instead.

use crate::config_store::ConfigValidationError;
use crate::plugin::manifest::ValidationError;
use crate::plugin::state::PluginState;

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for the plugin runtime.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The manifest was rejected; the plugin was never registered.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A plugin with the same id is active and cannot be replaced.
    #[error("Plugin {id} is {state} and cannot be replaced")]
    Conflict { id: String, state: PluginState },

    /// Plugin not found.
    #[error("Plugin not found: {0}")]
    NotFound(String),

    /// A declared dependency is not running.
    #[error("Plugin {plugin} depends on {dependency}, which is {status}")]
    Dependency {
        plugin: String,
        dependency: String,
        status: String,
    },

    /// The code unit could not be instantiated.
    #[error("Failed to load plugin {plugin}: {cause}")]
    Load { plugin: String, cause: String },

    /// The init entry point failed, returned false, or timed out.
    #[error("Plugin {plugin} failed to initialize: {cause}")]
    Initialization { plugin: String, cause: String },

    /// The requested transition is not on the lifecycle graph.
    #[error("Invalid state transition for {plugin}: {from} -> {to}")]
    InvalidTransition {
        plugin: String,
        from: PluginState,
        to: PluginState,
    },

    /// A configuration update was rejected; the prior document is retained.
    #[error(transparent)]
    ConfigValidation(#[from] ConfigValidationError),

    /// The plugin did not declare the capability.
    #[error("Permission denied: {plugin} is not granted {capability}")]
    PermissionDenied { plugin: String, capability: String },

    /// Hook event name does not match the dot-namespaced grammar.
    #[error("Invalid hook event name: {0}")]
    InvalidHookName(String),

    /// Operation is not supported by the plugin or in its current state.
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Runtime configuration could not be read.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Durable storage failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization/deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Stable error code for structured logging.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::Conflict { .. } => "conflict_error",
            Self::NotFound(_) => "not_found",
            Self::Dependency { .. } => "dependency_error",
            Self::Load { .. } => "load_error",
            Self::Initialization { .. } => "initialization_error",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::ConfigValidation(_) => "config_validation_error",
            Self::PermissionDenied { .. } => "permission_denied",
            Self::InvalidHookName(_) => "invalid_hook_name",
            Self::NotSupported(_) => "not_supported",
            Self::Config(_) => "config_error",
            Self::Storage(_) => "storage_error",
            Self::Serialization(_) => "serialization_error",
        }
    }

    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound(id.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn load(plugin: impl Into<String>, cause: impl Into<String>) -> Self {
        Self::Load {
            plugin: plugin.into(),
            cause: cause.into(),
        }
    }

    pub fn initialization(plugin: impl Into<String>, cause: impl Into<String>) -> Self {
        Self::Initialization {
            plugin: plugin.into(),
            cause: cause.into(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Dependency {
            plugin: "p2".to_string(),
            dependency: "p1".to_string(),
            status: "loaded".to_string(),
        };
        assert_eq!(err.to_string(), "Plugin p2 depends on p1, which is loaded");

        let err = Error::Conflict {
            id: "p1".to_string(),
            state: PluginState::Running,
        };
        assert!(err.to_string().contains("running"));
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(Error::not_found("x").code(), "not_found");
        assert_eq!(Error::load("x", "boom").code(), "load_error");
        assert_eq!(
            Error::initialization("x", "timed out").code(),
            "initialization_error"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: Error = io.into();
        assert!(matches!(err, Error::Storage(_)));
    }
}
