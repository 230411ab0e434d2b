//! Named-event publish/subscribe with ordered, isolated dispatch.
//!
//! Handlers for one event name are invoked sequentially in registration
//! order. A handler that fails, panics or overruns its timeout is recorded in
//! the [`DispatchReport`] and broadcast as a [`HookFailure`]; dispatch then
//! moves on to the next handler.
//!
//! Each event name has its own registration list behind its own lock, so
//! register/unregister/emit on one name are serialized while different names
//! proceed independently. `emit` dispatches to a snapshot of the list taken
//! when it starts, skipping any handler unregistered before its turn.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::{Error, Result};
use crate::plugin::factory::panic_message;
use crate::plugin::manifest::is_valid_identifier;

/// Owner id used for handlers registered by the host itself.
pub const HOST_OWNER: &str = "host";

const FAILURE_CHANNEL_CAPACITY: usize = 256;

/// An emitted event as seen by handlers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookEvent {
    pub name: String,
    pub payload: Value,
    pub emitted_at: DateTime<Utc>,
}

impl HookEvent {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
            emitted_at: Utc::now(),
        }
    }

    /// Namespace segment, e.g. `device` for `device.reading`.
    pub fn namespace(&self) -> &str {
        self.name.split('.').next().unwrap_or_default()
    }
}

/// Failure returned by a handler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HookError {
    /// Recoverable; counted against the owner's failure threshold.
    #[error("{0}")]
    Failed(String),

    /// The owner cannot continue and should be moved to `error`.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl HookError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }
}

/// Subscriber for hook events.
#[async_trait::async_trait]
pub trait HookHandler: Send + Sync {
    async fn handle(&self, event: &HookEvent) -> std::result::Result<(), HookError>;

    /// Name used in logs and dispatch reports.
    fn name(&self) -> &str {
        "anonymous"
    }
}

pub type SharedHandler = Arc<dyn HookHandler>;

type HandlerFn =
    Arc<dyn Fn(HookEvent) -> BoxFuture<'static, std::result::Result<(), HookError>> + Send + Sync>;

struct FnHandler {
    name: String,
    f: HandlerFn,
}

#[async_trait::async_trait]
impl HookHandler for FnHandler {
    async fn handle(&self, event: &HookEvent) -> std::result::Result<(), HookError> {
        (self.f)(event.clone()).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Build a handler from an async closure.
///
/// ```ignore
/// let handler = hook_fn("log-readings", |event| async move {
///     tracing::info!(payload = %event.payload, "reading");
///     Ok(())
/// });
/// ```
pub fn hook_fn<F, Fut>(name: impl Into<String>, f: F) -> SharedHandler
where
    F: Fn(HookEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), HookError>> + Send + 'static,
{
    Arc::new(FnHandler {
        name: name.into(),
        f: Arc::new(move |event| f(event).boxed()),
    })
}

/// Handler identity: the same allocation, regardless of vtable.
pub(crate) fn same_handler(a: &SharedHandler, b: &SharedHandler) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// (event name, owning plugin id, handler).
#[derive(Clone)]
pub struct HookRegistration {
    pub event: String,
    pub plugin_id: String,
    pub handler: SharedHandler,
    pub registered_at: DateTime<Utc>,
}

impl HookRegistration {
    fn matches(&self, plugin_id: &str, handler: &SharedHandler) -> bool {
        self.plugin_id == plugin_id && same_handler(&self.handler, handler)
    }
}

impl std::fmt::Debug for HookRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistration")
            .field("event", &self.event)
            .field("plugin_id", &self.plugin_id)
            .field("handler", &self.handler.name())
            .field("registered_at", &self.registered_at)
            .finish()
    }
}

/// Outcome of one handler invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "message", rename_all = "snake_case")]
pub enum HandlerStatus {
    Ok,
    Failed(String),
    Fatal(String),
    TimedOut,
    Panicked(String),
}

impl HandlerStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, HandlerStatus::Ok)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerOutcome {
    pub plugin_id: String,
    pub handler: String,
    pub status: HandlerStatus,
    pub elapsed_ms: u64,
}

/// Result of one `emit`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchReport {
    pub event: String,
    /// One entry per invoked handler, in invocation order.
    pub outcomes: Vec<HandlerOutcome>,
}

impl DispatchReport {
    pub fn invoked(&self) -> usize {
        self.outcomes.len()
    }

    pub fn failures(&self) -> impl Iterator<Item = &HandlerOutcome> {
        self.outcomes.iter().filter(|o| !o.status.is_ok())
    }

    pub fn failure_count(&self) -> usize {
        self.failures().count()
    }

    pub fn all_ok(&self) -> bool {
        self.failure_count() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookFailureKind {
    Failed,
    Fatal,
    TimedOut,
    Panicked,
}

/// A handler failure, broadcast to subscribers of [`HookBus::subscribe_failures`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookFailure {
    pub event: String,
    pub plugin_id: String,
    pub handler: String,
    pub kind: HookFailureKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

type EventSlot = Arc<Mutex<Vec<HookRegistration>>>;

/// Hook registry and dispatcher.
pub struct HookBus {
    events: RwLock<HashMap<String, EventSlot>>,
    handler_timeout: Option<Duration>,
    failures: broadcast::Sender<HookFailure>,
}

impl HookBus {
    /// `handler_timeout` bounds each handler invocation; `None` is unbounded.
    pub fn new(handler_timeout: Option<Duration>) -> Self {
        let (failures, _) = broadcast::channel(FAILURE_CHANNEL_CAPACITY);
        Self {
            events: RwLock::new(HashMap::new()),
            handler_timeout,
            failures,
        }
    }

    fn slot(&self, event: &str) -> Option<EventSlot> {
        self.events.read().get(event).cloned()
    }

    fn slot_or_create(&self, event: &str) -> EventSlot {
        if let Some(slot) = self.slot(event) {
            return slot;
        }
        self.events
            .write()
            .entry(event.to_string())
            .or_default()
            .clone()
    }

    /// Append a registration.
    ///
    /// Returns `Ok(false)` when the exact triple is already registered.
    pub fn register(&self, event: &str, plugin_id: &str, handler: SharedHandler) -> Result<bool> {
        if !is_valid_identifier(event) {
            return Err(Error::InvalidHookName(event.to_string()));
        }

        let slot = self.slot_or_create(event);
        let mut regs = slot.lock();
        if regs.iter().any(|r| r.matches(plugin_id, &handler)) {
            return Ok(false);
        }

        tracing::debug!(
            event = %event,
            plugin_id = %plugin_id,
            handler = %handler.name(),
            "Hook registered"
        );
        regs.push(HookRegistration {
            event: event.to_string(),
            plugin_id: plugin_id.to_string(),
            handler,
            registered_at: Utc::now(),
        });
        Ok(true)
    }

    /// Remove exactly the triple. Returns `false` if it was not registered.
    pub fn unregister(&self, event: &str, plugin_id: &str, handler: &SharedHandler) -> bool {
        let Some(slot) = self.slot(event) else {
            return false;
        };
        let mut regs = slot.lock();
        let Some(pos) = regs.iter().position(|r| r.matches(plugin_id, handler)) else {
            return false;
        };
        regs.remove(pos);
        tracing::debug!(event = %event, plugin_id = %plugin_id, "Hook unregistered");
        true
    }

    /// Remove every registration owned by `plugin_id`. Returns how many were removed.
    pub fn unregister_plugin(&self, plugin_id: &str) -> usize {
        let slots: Vec<EventSlot> = self.events.read().values().cloned().collect();
        let mut removed = 0;
        for slot in slots {
            let mut regs = slot.lock();
            let before = regs.len();
            regs.retain(|r| r.plugin_id != plugin_id);
            removed += before - regs.len();
        }
        if removed > 0 {
            tracing::debug!(plugin_id = %plugin_id, removed, "Hooks purged");
        }
        removed
    }

    /// Registrations for one event, in dispatch order.
    pub fn registrations(&self, event: &str) -> Vec<HookRegistration> {
        self.slot(event)
            .map(|slot| slot.lock().clone())
            .unwrap_or_default()
    }

    pub fn handler_count(&self, event: &str) -> usize {
        self.slot(event).map(|slot| slot.lock().len()).unwrap_or(0)
    }

    /// Number of registrations owned by a plugin across all events.
    pub fn plugin_registration_count(&self, plugin_id: &str) -> usize {
        let slots: Vec<EventSlot> = self.events.read().values().cloned().collect();
        slots
            .iter()
            .map(|slot| slot.lock().iter().filter(|r| r.plugin_id == plugin_id).count())
            .sum()
    }

    /// Event names with at least one registration.
    pub fn events(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .events
            .read()
            .iter()
            .filter(|(_, slot)| !slot.lock().is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn subscribe_failures(&self) -> broadcast::Receiver<HookFailure> {
        self.failures.subscribe()
    }

    /// Dispatch `payload` to every handler of `event` and wait for all of them.
    pub async fn emit(&self, event: &str, payload: Value) -> DispatchReport {
        let mut report = DispatchReport {
            event: event.to_string(),
            outcomes: Vec::new(),
        };

        let Some(slot) = self.slot(event) else {
            return report;
        };
        let snapshot: Vec<HookRegistration> = slot.lock().clone();
        if snapshot.is_empty() {
            return report;
        }

        let hook_event = HookEvent::new(event, payload);

        for reg in snapshot {
            let still_registered = slot
                .lock()
                .iter()
                .any(|r| r.matches(&reg.plugin_id, &reg.handler));
            if !still_registered {
                continue;
            }

            let started = Instant::now();
            let status = self.invoke(&reg.handler, &hook_event).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            if let Some((kind, message)) = failure_parts(&status) {
                tracing::warn!(
                    event = %event,
                    plugin_id = %reg.plugin_id,
                    handler = %reg.handler.name(),
                    kind = ?kind,
                    "Hook handler failed: {}",
                    message
                );
                let _ = self.failures.send(HookFailure {
                    event: event.to_string(),
                    plugin_id: reg.plugin_id.clone(),
                    handler: reg.handler.name().to_string(),
                    kind,
                    message,
                    at: Utc::now(),
                });
            }

            report.outcomes.push(HandlerOutcome {
                plugin_id: reg.plugin_id,
                handler: reg.handler.name().to_string(),
                status,
                elapsed_ms,
            });
        }

        report
    }

    async fn invoke(&self, handler: &SharedHandler, event: &HookEvent) -> HandlerStatus {
        let call = std::panic::AssertUnwindSafe(handler.handle(event)).catch_unwind();
        let result = match self.handler_timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(r) => r,
                Err(_) => return HandlerStatus::TimedOut,
            },
            None => call.await,
        };

        match result {
            Ok(Ok(())) => HandlerStatus::Ok,
            Ok(Err(HookError::Failed(msg))) => HandlerStatus::Failed(msg),
            Ok(Err(HookError::Fatal(msg))) => HandlerStatus::Fatal(msg),
            Err(panic) => HandlerStatus::Panicked(panic_message(panic.as_ref())),
        }
    }
}

impl Default for HookBus {
    fn default() -> Self {
        Self::new(Some(Duration::from_millis(
            crate::config::defaults::HOOK_TIMEOUT_MS,
        )))
    }
}

fn failure_parts(status: &HandlerStatus) -> Option<(HookFailureKind, String)> {
    match status {
        HandlerStatus::Ok => None,
        HandlerStatus::Failed(m) => Some((HookFailureKind::Failed, m.clone())),
        HandlerStatus::Fatal(m) => Some((HookFailureKind::Fatal, m.clone())),
        HandlerStatus::TimedOut => Some((HookFailureKind::TimedOut, "handler timed out".to_string())),
        HandlerStatus::Panicked(m) => Some((HookFailureKind::Panicked, format!("handler panicked: {}", m))),
    }
}
