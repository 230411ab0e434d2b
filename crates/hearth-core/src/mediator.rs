//! The only path from a plugin instance to host functionality.
//!
//! Every call is checked by the [`PermissionGuard`] first; a denied call never
//! reaches the collaborator. Collaborator errors are translated into
//! [`MediatorError`] so plugins never see host-internal types.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::Error;
use crate::hooks::{DispatchReport, HookBus};
use crate::permission::PermissionGuard;
use crate::plugin::manifest::is_valid_identifier;

/// Capability strings checked by the mediator.
pub mod capabilities {
    pub const DEVICES_READ: &str = "devices.read";
    pub const DEVICES_CONTROL: &str = "devices.control";
    pub const NOTIFICATIONS_SEND: &str = "notifications.send";
    pub const HOOKS_EMIT: &str = "hooks.emit";

    /// Either grants `notify`: device readers may alert on what they read.
    pub const NOTIFY: [&str; 2] = [NOTIFICATIONS_SEND, DEVICES_READ];
}

/// Namespaces only the host may emit into.
pub const HOST_ONLY_NAMESPACES: [&str; 4] = ["device", "system", "notification", "plugin"];

/// Error reported by a host collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The calling plugin's session cannot continue.
    #[error("fatal: {0}")]
    Fatal(String),
}

/// Error returned to plugin code.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MediatorError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl From<ProviderError> for MediatorError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::NotFound(m) => MediatorError::NotFound(m),
            ProviderError::Invalid(m) => MediatorError::InvalidRequest(m),
            ProviderError::Unavailable(m) | ProviderError::Fatal(m) => {
                MediatorError::Unavailable(m)
            }
        }
    }
}

pub type MediatorResult<T> = std::result::Result<T, MediatorError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub device_type: String,
}

/// Host-side source of device data.
#[async_trait::async_trait]
pub trait DeviceDataProvider: Send + Sync {
    async fn list_devices(&self) -> Result<Vec<DeviceInfo>, ProviderError>;

    async fn device_state(&self, device_id: &str) -> Result<Value, ProviderError>;

    async fn send_command(
        &self,
        device_id: &str,
        command: &str,
        params: &Value,
    ) -> Result<Value, ProviderError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    #[default]
    Info,
    Warning,
    Critical,
}

/// A notification raised by a plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub plugin_id: String,
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub level: NotificationLevel,
    #[serde(default)]
    pub data: Value,
    pub created_at: DateTime<Utc>,
}

/// Outbound notification channel.
#[async_trait::async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, notification: Notification) -> Result<(), ProviderError>;
}

/// Fatal collaborator failure attributed to a plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediatorFault {
    pub plugin_id: String,
    pub message: String,
}

/// Permission-gated facade over host collaborators.
pub struct ResourceMediator {
    guard: Arc<PermissionGuard>,
    hooks: Arc<HookBus>,
    devices: Option<Arc<dyn DeviceDataProvider>>,
    notifications: Option<Arc<dyn NotificationSink>>,
    faults: Option<mpsc::UnboundedSender<MediatorFault>>,
}

impl ResourceMediator {
    pub fn new(guard: Arc<PermissionGuard>, hooks: Arc<HookBus>) -> Self {
        Self {
            guard,
            hooks,
            devices: None,
            notifications: None,
            faults: None,
        }
    }

    pub fn with_devices(mut self, devices: Arc<dyn DeviceDataProvider>) -> Self {
        self.devices = Some(devices);
        self
    }

    pub fn with_notifications(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.notifications = Some(sink);
        self
    }

    /// Channel receiving [`MediatorFault`]s.
    pub fn with_fault_channel(mut self, tx: mpsc::UnboundedSender<MediatorFault>) -> Self {
        self.faults = Some(tx);
        self
    }

    fn authorize(&self, plugin_id: &str, capability: &str) -> MediatorResult<()> {
        self.guard
            .check(plugin_id, capability)
            .map_err(|_| MediatorError::PermissionDenied(capability.to_string()))?;
        tracing::debug!(
            target: "hearth::audit",
            plugin_id = %plugin_id,
            capability = %capability,
            "Mediated call"
        );
        Ok(())
    }

    fn authorize_any(&self, plugin_id: &str, accepted: &[&str]) -> MediatorResult<()> {
        self.guard.check_any(plugin_id, accepted).map_err(|e| match e {
            Error::PermissionDenied { capability, .. } => MediatorError::PermissionDenied(capability),
            other => MediatorError::PermissionDenied(other.to_string()),
        })?;
        tracing::debug!(
            target: "hearth::audit",
            plugin_id = %plugin_id,
            capabilities = ?accepted,
            "Mediated call"
        );
        Ok(())
    }

    fn translate(&self, plugin_id: &str, err: ProviderError) -> MediatorError {
        if let ProviderError::Fatal(message) = &err {
            tracing::error!(plugin_id = %plugin_id, "Collaborator reported fatal failure: {}", message);
            if let Some(tx) = &self.faults {
                let _ = tx.send(MediatorFault {
                    plugin_id: plugin_id.to_string(),
                    message: message.clone(),
                });
            }
        }
        err.into()
    }

    fn devices(&self) -> MediatorResult<&Arc<dyn DeviceDataProvider>> {
        self.devices
            .as_ref()
            .ok_or_else(|| MediatorError::Unavailable("no device provider configured".into()))
    }

    pub async fn list_devices(&self, plugin_id: &str) -> MediatorResult<Vec<DeviceInfo>> {
        self.authorize(plugin_id, capabilities::DEVICES_READ)?;
        self.devices()?
            .list_devices()
            .await
            .map_err(|e| self.translate(plugin_id, e))
    }

    pub async fn device_state(&self, plugin_id: &str, device_id: &str) -> MediatorResult<Value> {
        self.authorize(plugin_id, capabilities::DEVICES_READ)?;
        self.devices()?
            .device_state(device_id)
            .await
            .map_err(|e| self.translate(plugin_id, e))
    }

    pub async fn send_command(
        &self,
        plugin_id: &str,
        device_id: &str,
        command: &str,
        params: &Value,
    ) -> MediatorResult<Value> {
        self.authorize(plugin_id, capabilities::DEVICES_CONTROL)?;
        self.devices()?
            .send_command(device_id, command, params)
            .await
            .map_err(|e| self.translate(plugin_id, e))
    }

    pub async fn notify(
        &self,
        plugin_id: &str,
        title: &str,
        message: &str,
        level: NotificationLevel,
        data: Value,
    ) -> MediatorResult<()> {
        self.authorize_any(plugin_id, &capabilities::NOTIFY)?;
        let sink = self
            .notifications
            .as_ref()
            .ok_or_else(|| MediatorError::Unavailable("no notification sink configured".into()))?;
        sink.send(Notification {
            plugin_id: plugin_id.to_string(),
            title: title.to_string(),
            message: message.to_string(),
            level,
            data,
            created_at: Utc::now(),
        })
        .await
        .map_err(|e| self.translate(plugin_id, e))
    }

    /// Emit a hook event on behalf of a plugin.
    pub async fn emit_hook(
        &self,
        plugin_id: &str,
        event: &str,
        payload: Value,
    ) -> MediatorResult<DispatchReport> {
        self.authorize(plugin_id, capabilities::HOOKS_EMIT)?;
        if !is_valid_identifier(event) {
            return Err(MediatorError::InvalidRequest(format!(
                "invalid hook event name '{}'",
                event
            )));
        }
        let namespace = event.split('.').next().unwrap_or_default();
        if HOST_ONLY_NAMESPACES.contains(&namespace) {
            return Err(MediatorError::PermissionDenied(format!(
                "{}.* is reserved for the host",
                namespace
            )));
        }
        Ok(self.hooks.emit(event, payload).await)
    }
}

impl fmt::Debug for ResourceMediator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceMediator")
            .field("devices", &self.devices.is_some())
            .field("notifications", &self.notifications.is_some())
            .finish_non_exhaustive()
    }
}

/// Mediator bound to one plugin id, handed out through its context.
#[derive(Clone)]
pub struct PluginMediator {
    inner: Arc<ResourceMediator>,
    plugin_id: String,
}

impl PluginMediator {
    pub(crate) fn new(inner: Arc<ResourceMediator>, plugin_id: impl Into<String>) -> Self {
        Self {
            inner,
            plugin_id: plugin_id.into(),
        }
    }

    pub async fn list_devices(&self) -> MediatorResult<Vec<DeviceInfo>> {
        self.inner.list_devices(&self.plugin_id).await
    }

    pub async fn device_state(&self, device_id: &str) -> MediatorResult<Value> {
        self.inner.device_state(&self.plugin_id, device_id).await
    }

    pub async fn send_command(
        &self,
        device_id: &str,
        command: &str,
        params: &Value,
    ) -> MediatorResult<Value> {
        self.inner
            .send_command(&self.plugin_id, device_id, command, params)
            .await
    }

    pub async fn notify(
        &self,
        title: &str,
        message: &str,
        level: NotificationLevel,
        data: Value,
    ) -> MediatorResult<()> {
        self.inner
            .notify(&self.plugin_id, title, message, level, data)
            .await
    }

    pub async fn emit_hook(&self, event: &str, payload: Value) -> MediatorResult<DispatchReport> {
        self.inner.emit_hook(&self.plugin_id, event, payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingDevices {
        calls: AtomicUsize,
        fail_fatal: bool,
    }

    #[async_trait::async_trait]
    impl DeviceDataProvider for CountingDevices {
        async fn list_devices(&self) -> Result<Vec<DeviceInfo>, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_fatal {
                return Err(ProviderError::Fatal("bus offline".into()));
            }
            Ok(vec![DeviceInfo {
                id: "d1".into(),
                name: "Thermometer".into(),
                device_type: "sensor".into(),
            }])
        }

        async fn device_state(&self, device_id: &str) -> Result<Value, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ProviderError::NotFound(device_id.to_string()))
        }

        async fn send_command(
            &self,
            _device_id: &str,
            _command: &str,
            _params: &Value,
        ) -> Result<Value, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"ok": true}))
        }
    }

    #[derive(Default)]
    struct Outbox(Mutex<Vec<Notification>>);

    #[async_trait::async_trait]
    impl NotificationSink for Outbox {
        async fn send(&self, notification: Notification) -> Result<(), ProviderError> {
            self.0.lock().push(notification);
            Ok(())
        }
    }

    fn mediator(devices: Arc<CountingDevices>) -> (ResourceMediator, Arc<PermissionGuard>) {
        let guard = Arc::new(PermissionGuard::new());
        let mediator = ResourceMediator::new(guard.clone(), Arc::new(HookBus::default()))
            .with_devices(devices);
        (mediator, guard)
    }

    #[tokio::test]
    async fn test_denied_call_never_reaches_collaborator() {
        let devices = Arc::new(CountingDevices::default());
        let (mediator, guard) = mediator(devices.clone());
        guard.grant("p1", ["notifications.send"]);

        let err = mediator.list_devices("p1").await.unwrap_err();
        assert_eq!(err, MediatorError::PermissionDenied("devices.read".into()));
        let err = mediator
            .send_command("p1", "d1", "on", &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, MediatorError::PermissionDenied(_)));
        assert_eq!(devices.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_allowed_call_forwards() {
        let devices = Arc::new(CountingDevices::default());
        let (mediator, guard) = mediator(devices.clone());
        guard.grant("p1", ["devices.read"]);

        let list = mediator.list_devices("p1").await.unwrap();
        assert_eq!(list[0].id, "d1");
        let err = mediator.device_state("p1", "d9").await.unwrap_err();
        assert_eq!(err, MediatorError::NotFound("d9".into()));
    }

    #[tokio::test]
    async fn test_fatal_error_signals_fault() {
        let devices = Arc::new(CountingDevices {
            fail_fatal: true,
            ..Default::default()
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        let guard = Arc::new(PermissionGuard::new());
        guard.grant("p1", ["devices.read"]);
        let mediator = ResourceMediator::new(guard, Arc::new(HookBus::default()))
            .with_devices(devices)
            .with_fault_channel(tx);

        let err = mediator.list_devices("p1").await.unwrap_err();
        assert_eq!(err, MediatorError::Unavailable("bus offline".into()));
        let fault = rx.recv().await.unwrap();
        assert_eq!(fault.plugin_id, "p1");
    }

    #[tokio::test]
    async fn test_notify() {
        let outbox = Arc::new(Outbox::default());
        let guard = Arc::new(PermissionGuard::new());
        guard.grant("p1", ["notifications.send"]);
        let mediator = ResourceMediator::new(guard, Arc::new(HookBus::default()))
            .with_notifications(outbox.clone());

        PluginMediator::new(Arc::new(mediator), "p1")
            .notify("Hot", "200 > 150", NotificationLevel::Warning, json!({"value": 200}))
            .await
            .unwrap();
        let sent = outbox.0.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].plugin_id, "p1");
        assert_eq!(sent[0].level, NotificationLevel::Warning);
    }

    #[tokio::test]
    async fn test_notify_allowed_for_device_readers_only() {
        let outbox = Arc::new(Outbox::default());
        let guard = Arc::new(PermissionGuard::new());
        guard.grant("reader", ["devices.read"]);
        guard.grant("emitter", ["hooks.emit"]);
        let mediator = ResourceMediator::new(guard, Arc::new(HookBus::default()))
            .with_notifications(outbox.clone());

        mediator
            .notify("reader", "Hot", "200 > 150", NotificationLevel::Warning, json!({}))
            .await
            .unwrap();
        let err = mediator
            .notify("emitter", "Hot", "200 > 150", NotificationLevel::Warning, json!({}))
            .await
            .unwrap_err();
        assert_eq!(err, MediatorError::PermissionDenied("notifications.send".into()));
        assert_eq!(outbox.0.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_collaborator() {
        let guard = Arc::new(PermissionGuard::new());
        guard.grant("p1", ["devices.read"]);
        let mediator = ResourceMediator::new(guard, Arc::new(HookBus::default()));
        assert!(matches!(
            mediator.list_devices("p1").await,
            Err(MediatorError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_emit_hook_reserved_namespace() {
        let guard = Arc::new(PermissionGuard::new());
        guard.grant("p1", ["hooks.emit"]);
        let mediator = ResourceMediator::new(guard, Arc::new(HookBus::default()));

        assert!(matches!(
            mediator.emit_hook("p1", "system.shutdown", json!({})).await,
            Err(MediatorError::PermissionDenied(_))
        ));
        assert!(matches!(
            mediator.emit_hook("p1", "plugin.started", json!({})).await,
            Err(MediatorError::PermissionDenied(_))
        ));
        let report = mediator.emit_hook("p1", "weather.update", json!({})).await.unwrap();
        assert_eq!(report.invoked(), 0);
    }
}
