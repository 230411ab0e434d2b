//! Shared fixtures for hearth-core integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};

use hearth_core::hooks::{hook_fn, HookError};
use hearth_core::mediator::{
    DeviceDataProvider, DeviceInfo, Notification, NotificationLevel, NotificationSink,
    ProviderError,
};
use hearth_core::plugin::{Plugin, PluginCapabilities, PluginContext, PluginFactory, PluginFault};
use hearth_core::{PluginRuntime, RuntimeConfig};

/// Minimal valid manifest with overrides applied on top.
pub fn manifest(id: &str, main_class: &str, extra: Value) -> Value {
    let mut raw = json!({
        "id": id,
        "name": id,
        "version": "1.0.0",
        "author": "tests",
        "description": "integration test plugin",
        "plugin_type": "analytics",
        "main_class": main_class,
        "api_version": "1.0"
    });
    if let Some(extra) = extra.as_object() {
        for (k, v) in extra {
            raw[k] = v.clone();
        }
    }
    raw
}

/// How a [`ScriptedPlugin`] behaves in `initialize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitBehavior {
    Succeed,
    Refuse,
    Fail,
    Panic,
    /// Registers its hooks, then never returns.
    Hang,
}

/// How the hook handler registered by a [`ScriptedPlugin`] behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerBehavior {
    Record,
    Fail,
    Fatal,
}

#[derive(Debug, Default)]
pub struct Counters {
    pub inits: AtomicUsize,
    pub shutdowns: AtomicUsize,
    pub handled: AtomicUsize,
}

impl Counters {
    pub fn inits(&self) -> usize {
        self.inits.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    pub fn handled(&self) -> usize {
        self.handled.load(Ordering::SeqCst)
    }
}

/// Test plugin driven by its constructor arguments.
pub struct ScriptedPlugin {
    pub init: InitBehavior,
    pub handler: HandlerBehavior,
    pub hooks: Vec<String>,
    pub background_task: bool,
    pub counters: Arc<Counters>,
}

#[async_trait::async_trait]
impl Plugin for ScriptedPlugin {
    fn capabilities(&self) -> PluginCapabilities {
        PluginCapabilities::all()
    }

    async fn initialize(&self, ctx: PluginContext) -> Result<bool, PluginFault> {
        self.counters.inits.fetch_add(1, Ordering::SeqCst);

        for event in &self.hooks {
            let counters = self.counters.clone();
            let behavior = self.handler;
            let handler = hook_fn(format!("{}-handler", ctx.plugin_id()), move |_event| {
                let counters = counters.clone();
                async move {
                    counters.handled.fetch_add(1, Ordering::SeqCst);
                    match behavior {
                        HandlerBehavior::Record => Ok(()),
                        HandlerBehavior::Fail => Err(HookError::failed("scripted failure")),
                        HandlerBehavior::Fatal => Err(HookError::fatal("scripted fatal")),
                    }
                }
            });
            ctx.register_hook(event, handler)
                .map_err(|e| PluginFault::new(e.to_string()))?;
        }

        if self.background_task {
            ctx.spawn("ticker", |token| async move { token.cancelled().await })
                .map_err(|e| PluginFault::new(e.to_string()))?;
        }

        match self.init {
            InitBehavior::Succeed => Ok(true),
            InitBehavior::Refuse => Ok(false),
            InitBehavior::Fail => Err(PluginFault::new("scripted init failure")),
            InitBehavior::Panic => panic!("scripted init panic"),
            InitBehavior::Hang => {
                tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
                Ok(true)
            }
        }
    }

    async fn shutdown(&self) -> Result<(), PluginFault> {
        self.counters.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_status(&self) -> serde_json::Map<String, Value> {
        let mut status = serde_json::Map::new();
        status.insert("inits".into(), json!(self.counters.inits()));
        status
    }

    async fn handle_action(&self, action: &str, params: &Value) -> hearth_core::plugin::ActionResponse {
        match action {
            "echo" => hearth_core::plugin::ActionResponse::success().with_data("echo", params.clone()),
            "explode" => panic!("scripted action panic"),
            other => hearth_core::plugin::ActionResponse::error(format!("Unknown action: {}", other)),
        }
    }
}

/// Register a scripted constructor under `main_class`.
pub fn register_scripted(
    factory: &PluginFactory,
    main_class: &str,
    init: InitBehavior,
    handler: HandlerBehavior,
    hooks: &[&str],
    background_task: bool,
) -> Arc<Counters> {
    let counters = Arc::new(Counters::default());
    let shared = counters.clone();
    let hooks: Vec<String> = hooks.iter().map(|h| h.to_string()).collect();
    factory.register_fn(main_class, move |_m| ScriptedPlugin {
        init,
        handler,
        hooks: hooks.clone(),
        background_task,
        counters: shared.clone(),
    });
    counters
}

/// Notification sink that records everything it receives.
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub sent: Mutex<Vec<Notification>>,
}

impl RecordingSink {
    pub fn count(&self) -> usize {
        self.sent.lock().len()
    }
}

#[async_trait::async_trait]
impl NotificationSink for RecordingSink {
    async fn send(&self, notification: Notification) -> Result<(), ProviderError> {
        self.sent.lock().push(notification);
        Ok(())
    }
}

/// Fixed set of devices.
#[derive(Debug, Default)]
pub struct StaticDevices {
    pub devices: Vec<DeviceInfo>,
}

#[async_trait::async_trait]
impl DeviceDataProvider for StaticDevices {
    async fn list_devices(&self) -> Result<Vec<DeviceInfo>, ProviderError> {
        Ok(self.devices.clone())
    }

    async fn device_state(&self, device_id: &str) -> Result<Value, ProviderError> {
        match device_id {
            "broken" => Err(ProviderError::Fatal("device bus gone".into())),
            id if self.devices.iter().any(|d| d.id == id) => Ok(json!({ "online": true })),
            other => Err(ProviderError::NotFound(other.to_string())),
        }
    }

    async fn send_command(
        &self,
        device_id: &str,
        _command: &str,
        _params: &Value,
    ) -> Result<Value, ProviderError> {
        Err(ProviderError::Unavailable(format!("{} is read-only", device_id)))
    }
}

/// Power-threshold plugin: notifies when a reading exceeds its configured
/// `threshold`.
pub struct ThresholdPlugin;

#[async_trait::async_trait]
impl Plugin for ThresholdPlugin {
    async fn initialize(&self, ctx: PluginContext) -> Result<bool, PluginFault> {
        let handler_ctx = ctx.clone();
        let handler = hook_fn("power-threshold", move |event| {
            let ctx = handler_ctx.clone();
            async move {
                let threshold = ctx
                    .config()
                    .value("threshold")
                    .await
                    .map_err(|e| HookError::failed(e.to_string()))?
                    .and_then(|v| v.as_f64())
                    .unwrap_or(f64::MAX);
                let power = event.payload["power"].as_f64().unwrap_or(0.0);
                if power > threshold {
                    ctx.mediator()
                        .notify(
                            "Power threshold exceeded",
                            &format!("{} > {}", power, threshold),
                            NotificationLevel::Warning,
                            json!({ "power": power }),
                        )
                        .await
                        .map_err(|e| HookError::failed(e.to_string()))?;
                }
                Ok(())
            }
        });
        ctx.register_hook("device.reading_updated", handler)
            .map_err(|e| PluginFault::new(e.to_string()))?;
        Ok(true)
    }

    async fn shutdown(&self) -> Result<(), PluginFault> {
        Ok(())
    }
}

/// Runtime with a recording sink, static devices and the given config tweaks.
pub fn runtime(
    config: RuntimeConfig,
    factory: PluginFactory,
) -> (PluginRuntime, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::default());
    let devices = Arc::new(StaticDevices {
        devices: vec![DeviceInfo {
            id: "meter-1".into(),
            name: "Main meter".into(),
            device_type: "power_meter".into(),
        }],
    });
    let runtime = PluginRuntime::builder(config)
        .factory(factory)
        .devices(devices)
        .notifications(sink.clone())
        .build()
        .unwrap();
    (runtime, sink)
}
