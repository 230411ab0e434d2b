//! Manifest discovery on disk.
//!
//! Each plugin directory is either a plugin itself (contains `plugin.json`)
//! or a parent whose immediate subdirectories are plugins.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::plugin::manifest::{Manifest, ManifestValidator};

/// Manifest file name inside a plugin directory.
pub const MANIFEST_FILE: &str = "plugin.json";

/// A manifest that was read and validated.
#[derive(Debug, Clone)]
pub struct DiscoveredPlugin {
    pub path: PathBuf,
    pub manifest: Manifest,
}

/// A manifest file that could not be accepted.
#[derive(Debug, Clone)]
pub struct RejectedManifest {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct DiscoveryReport {
    pub accepted: Vec<DiscoveredPlugin>,
    pub rejected: Vec<RejectedManifest>,
}

impl DiscoveryReport {
    pub fn manifests(&self) -> Vec<Manifest> {
        self.accepted.iter().map(|d| d.manifest.clone()).collect()
    }

    fn reject(&mut self, path: PathBuf, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::warn!(path = %path.display(), "Manifest rejected: {}", reason);
        self.rejected.push(RejectedManifest { path, reason });
    }
}

/// Scan `dirs` for plugin manifests.
///
/// Missing directories are skipped. A plugin id seen twice keeps the first
/// occurrence in scan order; later copies are rejected.
pub fn discover(dirs: &[PathBuf]) -> DiscoveryReport {
    let mut report = DiscoveryReport::default();
    let mut seen: HashMap<String, PathBuf> = HashMap::new();

    for dir in dirs {
        for path in manifest_paths(dir) {
            match read_manifest(&path) {
                Ok(manifest) => {
                    if let Some(first) = seen.get(&manifest.id) {
                        let reason = format!(
                            "duplicate plugin id '{}', already found at {}",
                            manifest.id,
                            first.display()
                        );
                        report.reject(path, reason);
                        continue;
                    }
                    seen.insert(manifest.id.clone(), path.clone());
                    tracing::debug!(plugin_id = %manifest.id, path = %path.display(), "Manifest discovered");
                    report.accepted.push(DiscoveredPlugin { path, manifest });
                }
                Err(reason) => report.reject(path, reason),
            }
        }
    }

    tracing::info!(
        accepted = report.accepted.len(),
        rejected = report.rejected.len(),
        "Plugin discovery finished"
    );
    report
}

/// Read and validate one manifest file.
pub fn read_manifest(path: &Path) -> Result<Manifest, String> {
    let text = std::fs::read_to_string(path).map_err(|e| format!("cannot read: {}", e))?;
    let raw: Value = serde_json::from_str(&text).map_err(|e| format!("invalid JSON: {}", e))?;
    ManifestValidator::validate(&raw).map_err(|e| e.to_string())
}

fn manifest_paths(dir: &Path) -> Vec<PathBuf> {
    let direct = dir.join(MANIFEST_FILE);
    if direct.is_file() {
        return vec![direct];
    }

    let Ok(entries) = std::fs::read_dir(dir) else {
        tracing::debug!(dir = %dir.display(), "Plugin directory not readable, skipping");
        return Vec::new();
    };

    let mut paths: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .map(|p| p.join(MANIFEST_FILE))
        .filter(|p| p.is_file())
        .collect();
    paths.sort();
    paths
}
