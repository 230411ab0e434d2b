//! Background tasks owned by a plugin.
//!
//! Every task gets a child of the set's cancellation token. On teardown the
//! token is cancelled and tasks get a grace period to return; stragglers are
//! aborted and reported by name.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

struct TaskEntry {
    name: String,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Handle returned to the plugin for a spawned task.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    name: String,
    token: CancellationToken,
}

impl TaskHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Request cooperative cancellation of this task only.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Outcome of [`TaskSet::shutdown`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskShutdownReport {
    pub completed: usize,
    /// Tasks that ignored cancellation past the grace period and were aborted.
    pub abandoned: Vec<String>,
}

/// Tracked background tasks for one plugin.
pub struct TaskSet {
    plugin_id: String,
    root: CancellationToken,
    tasks: Mutex<Vec<TaskEntry>>,
}

impl TaskSet {
    pub fn new(plugin_id: impl Into<String>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            root: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawn a task on the current runtime. The closure receives the task's
    /// cancellation token and should return soon after it fires.
    pub fn spawn<F, Fut>(&self, name: impl Into<String>, f: F) -> Result<TaskHandle>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let token = self.root.child_token();
        let task = f(token.clone());

        // checked under the lock so a concurrent shutdown either sees this
        // entry or this call sees the cancellation
        let mut tasks = self.tasks.lock();
        if self.root.is_cancelled() {
            return Err(Error::NotSupported(format!(
                "cannot spawn task '{}': plugin {} is shutting down",
                name, self.plugin_id
            )));
        }
        tasks.retain(|t| !t.handle.is_finished());
        tasks.push(TaskEntry {
            name: name.clone(),
            token: token.clone(),
            handle: tokio::spawn(task),
        });
        drop(tasks);

        tracing::debug!(plugin_id = %self.plugin_id, task = %name, "Background task spawned");
        Ok(TaskHandle { name, token })
    }

    /// Names of tasks that have not finished.
    pub fn active(&self) -> Vec<String> {
        self.tasks
            .lock()
            .iter()
            .filter(|t| !t.handle.is_finished())
            .map(|t| t.name.clone())
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.tasks
            .lock()
            .iter()
            .filter(|t| !t.handle.is_finished())
            .count()
    }

    pub fn is_closed(&self) -> bool {
        self.root.is_cancelled()
    }

    /// Cancel every task and wait up to `grace` for them to return.
    ///
    /// No further tasks can be spawned afterwards.
    pub async fn shutdown(&self, grace: Duration) -> TaskShutdownReport {
        let entries: Vec<TaskEntry> = {
            let mut tasks = self.tasks.lock();
            self.root.cancel();
            std::mem::take(&mut *tasks)
        };

        let deadline = tokio::time::Instant::now() + grace;
        let mut report = TaskShutdownReport::default();

        for mut entry in entries {
            entry.token.cancel();
            match tokio::time::timeout_at(deadline, &mut entry.handle).await {
                Ok(Ok(())) => report.completed += 1,
                Ok(Err(e)) => {
                    if e.is_panic() {
                        tracing::warn!(
                            plugin_id = %self.plugin_id,
                            task = %entry.name,
                            "Background task panicked"
                        );
                    }
                    report.completed += 1;
                }
                Err(_) => {
                    entry.handle.abort();
                    tracing::warn!(
                        plugin_id = %self.plugin_id,
                        task = %entry.name,
                        grace_ms = grace.as_millis() as u64,
                        "Background task ignored cancellation, abandoned"
                    );
                    report.abandoned.push(entry.name);
                }
            }
        }

        report
    }
}

impl std::fmt::Debug for TaskSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskSet")
            .field("plugin_id", &self.plugin_id)
            .field("active", &self.active())
            .field("closed", &self.is_closed())
            .finish()
    }
}
