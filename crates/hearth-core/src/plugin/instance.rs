//! The extension instance contract.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::context::PluginContext;

bitflags::bitflags! {
    /// Entry points a plugin instance implements.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PluginCapabilities: u32 {
        /// `initialize()`
        const INITIALIZE = 1 << 0;
        /// `shutdown()`
        const SHUTDOWN = 1 << 1;
        /// `get_status()`
        const STATUS = 1 << 2;
        /// `handle_action()`
        const ACTIONS = 1 << 3;
    }
}

impl PluginCapabilities {
    /// Every instance must provide these.
    pub const REQUIRED: Self = Self::INITIALIZE.union(Self::SHUTDOWN);
}

impl Default for PluginCapabilities {
    fn default() -> Self {
        Self::REQUIRED
    }
}

/// Failure reported by plugin code.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct PluginFault(pub String);

impl PluginFault {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

impl From<String> for PluginFault {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for PluginFault {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Success,
    Error,
}

/// `{status: "success"|"error", message?, ...}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResponse {
    pub status: ActionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl ActionResponse {
    pub fn success() -> Self {
        Self {
            status: ActionStatus::Success,
            message: None,
            data: Map::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ActionStatus::Error,
            message: Some(message.into()),
            data: Map::new(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ActionStatus::Success
    }
}

/// A loaded extension instance.
///
/// Instances never hold host state directly. Everything they reach goes
/// through the [`PluginContext`] passed to `initialize`.
#[async_trait::async_trait]
pub trait Plugin: Send + Sync {
    /// Entry points this instance implements. `get_status` and
    /// `handle_action` are only invoked when declared here.
    fn capabilities(&self) -> PluginCapabilities {
        PluginCapabilities::REQUIRED
    }

    /// Bring the plugin up. Returning `Ok(false)` is an explicit refusal.
    async fn initialize(&self, ctx: PluginContext) -> Result<bool, PluginFault>;

    /// Release resources. Background tasks and hooks are torn down by the
    /// host regardless of the outcome.
    async fn shutdown(&self) -> Result<(), PluginFault>;

    async fn get_status(&self) -> Map<String, Value> {
        Map::new()
    }

    async fn handle_action(&self, action: &str, _params: &Value) -> ActionResponse {
        ActionResponse::error(format!("Unknown action: {}", action))
    }
}

/// Shared handle to a plugin instance.
pub type DynPlugin = Arc<dyn Plugin>;

/// Opaque handle stored on the plugin record.
#[derive(Clone)]
pub struct InstanceHandle {
    pub(crate) instance: DynPlugin,
    pub(crate) capabilities: PluginCapabilities,
}

impl InstanceHandle {
    pub(crate) fn new(instance: DynPlugin) -> Self {
        let capabilities = instance.capabilities();
        Self {
            instance,
            capabilities,
        }
    }

    pub fn capabilities(&self) -> PluginCapabilities {
        self.capabilities
    }

    pub(crate) fn instance(&self) -> &DynPlugin {
        &self.instance
    }
}

impl fmt::Debug for InstanceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceHandle")
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_required_capabilities() {
        assert!(PluginCapabilities::default().contains(PluginCapabilities::REQUIRED));
        assert!(!PluginCapabilities::INITIALIZE.contains(PluginCapabilities::REQUIRED));
        let full = PluginCapabilities::all();
        assert!(full.contains(PluginCapabilities::STATUS | PluginCapabilities::ACTIONS));
    }

    #[test]
    fn test_action_response_shape() {
        let resp = ActionResponse::success()
            .with_message("done")
            .with_data("count", json!(3));
        assert_eq!(
            serde_json::to_value(&resp).unwrap(),
            json!({"status": "success", "message": "done", "count": 3})
        );

        let resp = ActionResponse::error("nope");
        assert_eq!(
            serde_json::to_value(&resp).unwrap(),
            json!({"status": "error", "message": "nope"})
        );
        assert!(!resp.is_success());
    }
}
