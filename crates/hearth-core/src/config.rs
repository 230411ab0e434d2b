//! Runtime configuration.
//!
//! Defaults live here so every crate in the workspace agrees on them. A
//! [`RuntimeConfig`] is read from an optional TOML file and then overridden by
//! environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default values.
pub mod defaults {
    /// Plugin API version implemented by this host.
    pub const API_VERSION: &str = "1.0";
    /// Upper bound for a plugin's `initialize()` call.
    pub const INIT_TIMEOUT_MS: u64 = 10_000;
    /// Grace period for background tasks to honor cancellation.
    pub const SHUTDOWN_GRACE_MS: u64 = 5_000;
    /// Upper bound for a single hook handler invocation.
    pub const HOOK_TIMEOUT_MS: u64 = 30_000;
    /// Sliding window used by the hook failure threshold.
    pub const HOOK_FAILURE_WINDOW_SECS: u64 = 60;
}

/// Environment variable names.
pub mod env_vars {
    pub const HOST_VERSION: &str = "HEARTH_HOST_VERSION";
    pub const INIT_TIMEOUT_MS: &str = "HEARTH_INIT_TIMEOUT_MS";
    pub const SHUTDOWN_GRACE_MS: &str = "HEARTH_SHUTDOWN_GRACE_MS";
    /// `0` disables the per-handler timeout.
    pub const HOOK_TIMEOUT_MS: &str = "HEARTH_HOOK_TIMEOUT_MS";
    /// `0` disables automatic error transitions on repeated hook failures.
    pub const HOOK_FAILURE_THRESHOLD: &str = "HEARTH_HOOK_FAILURE_THRESHOLD";
    pub const HOOK_FAILURE_WINDOW_SECS: &str = "HEARTH_HOOK_FAILURE_WINDOW_SECS";
    /// Platform path-list (`:` on unix, `;` on windows).
    pub const PLUGIN_DIRS: &str = "HEARTH_PLUGIN_DIRS";
    pub const STORE_PATH: &str = "HEARTH_STORE_PATH";
    pub const LOG_JSON: &str = "HEARTH_LOG_JSON";
}

fn default_host_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_api_version() -> String {
    defaults::API_VERSION.to_string()
}

fn default_init_timeout_ms() -> u64 {
    defaults::INIT_TIMEOUT_MS
}

fn default_shutdown_grace_ms() -> u64 {
    defaults::SHUTDOWN_GRACE_MS
}

fn default_hook_timeout_ms() -> Option<u64> {
    Some(defaults::HOOK_TIMEOUT_MS)
}

fn default_hook_failure_window_secs() -> u64 {
    defaults::HOOK_FAILURE_WINDOW_SECS
}

/// Host-side settings for the plugin runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Host application version, checked against `min_app_version`/`max_app_version`.
    #[serde(default = "default_host_version")]
    pub host_version: String,

    /// Plugin API version implemented by the host.
    #[serde(default = "default_api_version")]
    pub api_version: String,

    /// Init timeout in milliseconds.
    #[serde(default = "default_init_timeout_ms")]
    pub init_timeout_ms: u64,

    /// Background task grace period in milliseconds.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    /// Per-handler timeout in milliseconds; `None` means unbounded.
    #[serde(default = "default_hook_timeout_ms")]
    pub hook_timeout_ms: Option<u64>,

    /// Handler failures within the window that move a plugin to `error`.
    /// `None` disables the policy.
    #[serde(default)]
    pub hook_failure_threshold: Option<u32>,

    #[serde(default = "default_hook_failure_window_secs")]
    pub hook_failure_window_secs: u64,

    /// Directories scanned for `<plugin>/plugin.json`.
    #[serde(default)]
    pub plugin_dirs: Vec<PathBuf>,

    /// Durable store location, if any.
    #[serde(default)]
    pub store_path: Option<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            host_version: default_host_version(),
            api_version: default_api_version(),
            init_timeout_ms: default_init_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            hook_timeout_ms: default_hook_timeout_ms(),
            hook_failure_threshold: None,
            hook_failure_window_secs: default_hook_failure_window_secs(),
            plugin_dirs: Vec::new(),
            store_path: None,
        }
    }
}

impl RuntimeConfig {
    /// Parse a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }

    /// Read a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&content)
    }

    /// Load from an optional file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    /// Override fields from `HEARTH_*` environment variables.
    ///
    /// Unparseable values are ignored with a warning.
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var(env_vars::HOST_VERSION) {
            self.host_version = v;
        }
        if let Some(v) = env_parse::<u64>(env_vars::INIT_TIMEOUT_MS) {
            self.init_timeout_ms = v;
        }
        if let Some(v) = env_parse::<u64>(env_vars::SHUTDOWN_GRACE_MS) {
            self.shutdown_grace_ms = v;
        }
        if let Some(v) = env_parse::<u64>(env_vars::HOOK_TIMEOUT_MS) {
            self.hook_timeout_ms = (v > 0).then_some(v);
        }
        if let Some(v) = env_parse::<u32>(env_vars::HOOK_FAILURE_THRESHOLD) {
            self.hook_failure_threshold = (v > 0).then_some(v);
        }
        if let Some(v) = env_parse::<u64>(env_vars::HOOK_FAILURE_WINDOW_SECS) {
            self.hook_failure_window_secs = v;
        }
        if let Some(dirs) = std::env::var_os(env_vars::PLUGIN_DIRS) {
            self.plugin_dirs = std::env::split_paths(&dirs).collect();
        }
        if let Some(path) = std::env::var_os(env_vars::STORE_PATH) {
            self.store_path = Some(PathBuf::from(path));
        }
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn hook_timeout(&self) -> Option<Duration> {
        self.hook_timeout_ms.map(Duration::from_millis)
    }

    pub fn hook_failure_window(&self) -> Duration {
        Duration::from_secs(self.hook_failure_window_secs)
    }

    pub fn with_init_timeout(mut self, timeout: Duration) -> Self {
        self.init_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace_ms = grace.as_millis() as u64;
        self
    }

    pub fn with_hook_failure_threshold(mut self, threshold: u32, window: Duration) -> Self {
        self.hook_failure_threshold = Some(threshold);
        self.hook_failure_window_secs = window.as_secs();
        self
    }

    pub fn with_host_version(mut self, version: impl Into<String>) -> Self {
        self.host_version = version.into();
        self
    }

    pub fn with_plugin_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.plugin_dirs.push(dir.into());
        self
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "Ignoring unparseable environment override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.api_version, "1.0");
        assert_eq!(config.init_timeout(), Duration::from_secs(10));
        assert_eq!(config.shutdown_grace(), Duration::from_secs(5));
        assert_eq!(config.hook_timeout(), Some(Duration::from_secs(30)));
        assert!(config.hook_failure_threshold.is_none());
    }

    #[test]
    fn test_from_toml_partial() {
        let config = RuntimeConfig::from_toml_str(
            r#"
            init_timeout_ms = 250
            hook_failure_threshold = 3
            plugin_dirs = ["/opt/hearth/plugins"]
            "#,
        )
        .unwrap();

        assert_eq!(config.init_timeout(), Duration::from_millis(250));
        assert_eq!(config.hook_failure_threshold, Some(3));
        assert_eq!(config.plugin_dirs, vec![PathBuf::from("/opt/hearth/plugins")]);
        // untouched keys keep defaults
        assert_eq!(config.shutdown_grace_ms, defaults::SHUTDOWN_GRACE_MS);
    }

    #[test]
    fn test_from_toml_rejects_wrong_type() {
        let err = RuntimeConfig::from_toml_str("init_timeout_ms = \"soon\"").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_builders() {
        let config = RuntimeConfig::default()
            .with_init_timeout(Duration::from_millis(50))
            .with_hook_failure_threshold(2, Duration::from_secs(10))
            .with_host_version("2.1.0");
        assert_eq!(config.init_timeout_ms, 50);
        assert_eq!(config.hook_failure_threshold, Some(2));
        assert_eq!(config.hook_failure_window(), Duration::from_secs(10));
        assert_eq!(config.host_version, "2.1.0");
    }
}
