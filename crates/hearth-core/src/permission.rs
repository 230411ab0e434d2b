//! Capability gate consulted before every privileged call.
//!
//! A capability is allowed iff it appears verbatim in the plugin's manifest
//! `permissions`. Plugins without a grant, or with a malformed one, are
//! denied everything.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::plugin::manifest::is_valid_identifier;

#[derive(Debug, Clone)]
enum Grant {
    Granted(HashSet<String>),
    /// At least one entry failed the identifier grammar.
    Malformed,
}

/// Per-plugin capability grants.
#[derive(Debug, Default)]
pub struct PermissionGuard {
    grants: RwLock<HashMap<String, Grant>>,
}

impl PermissionGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the grant for a plugin, replacing any previous one.
    pub fn grant<I, S>(&self, plugin_id: &str, permissions: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let permissions: Vec<String> = permissions.into_iter().map(Into::into).collect();
        let grant = if permissions.iter().all(|p| is_valid_identifier(p)) {
            Grant::Granted(permissions.into_iter().collect())
        } else {
            tracing::warn!(
                plugin_id = %plugin_id,
                "Malformed permission list, denying all capabilities"
            );
            Grant::Malformed
        };
        self.grants.write().insert(plugin_id.to_string(), grant);
    }

    /// Drop the plugin's grant. Returns whether one existed.
    pub fn revoke(&self, plugin_id: &str) -> bool {
        self.grants.write().remove(plugin_id).is_some()
    }

    pub fn is_allowed(&self, plugin_id: &str, capability: &str) -> bool {
        match self.grants.read().get(plugin_id) {
            Some(Grant::Granted(set)) => set.contains(capability),
            Some(Grant::Malformed) | None => false,
        }
    }

    /// Allow, or [`Error::PermissionDenied`].
    pub fn check(&self, plugin_id: &str, capability: &str) -> Result<()> {
        if self.is_allowed(plugin_id, capability) {
            Ok(())
        } else {
            tracing::debug!(
                plugin_id = %plugin_id,
                capability = %capability,
                "Capability denied"
            );
            Err(Error::PermissionDenied {
                plugin: plugin_id.to_string(),
                capability: capability.to_string(),
            })
        }
    }

    /// Allow when any of `capabilities` is granted. The denial names the first.
    pub fn check_any(&self, plugin_id: &str, capabilities: &[&str]) -> Result<()> {
        match capabilities.iter().find(|c| self.is_allowed(plugin_id, c)) {
            Some(_) => Ok(()),
            None => self.check(plugin_id, capabilities.first().copied().unwrap_or_default()),
        }
    }

    pub fn granted(&self, plugin_id: &str) -> Vec<String> {
        match self.grants.read().get(plugin_id) {
            Some(Grant::Granted(set)) => {
                let mut caps: Vec<_> = set.iter().cloned().collect();
                caps.sort();
                caps
            }
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_denies_undeclared() {
        let guard = PermissionGuard::new();
        guard.grant("p1", ["notifications.send"]);

        assert!(guard.check("p1", "notifications.send").is_ok());
        let err = guard.check("p1", "devices.read").unwrap_err();
        assert!(matches!(err, Error::PermissionDenied { .. }));
    }

    #[test]
    fn test_verbatim_match_only() {
        let guard = PermissionGuard::new();
        guard.grant("p1", ["devices.read"]);
        assert!(!guard.is_allowed("p1", "devices"));
        assert!(!guard.is_allowed("p1", "devices.read.all"));
        assert!(!guard.is_allowed("p1", "DEVICES.READ"));
    }

    #[test]
    fn test_fails_closed() {
        let guard = PermissionGuard::new();
        assert!(!guard.is_allowed("unknown", "devices.read"));

        guard.grant("p1", ["devices.read", "not a capability"]);
        assert!(!guard.is_allowed("p1", "devices.read"));
        assert!(guard.granted("p1").is_empty());
    }

    #[test]
    fn test_check_any() {
        let guard = PermissionGuard::new();
        guard.grant("p1", ["devices.read"]);
        assert!(guard.check_any("p1", &["notifications.send", "devices.read"]).is_ok());

        let err = guard.check_any("p1", &["hooks.emit", "devices.control"]).unwrap_err();
        assert!(matches!(
            err,
            Error::PermissionDenied { ref capability, .. } if capability == "hooks.emit"
        ));
        assert!(guard.check_any("p1", &[]).is_err());
    }

    #[test]
    fn test_revoke() {
        let guard = PermissionGuard::new();
        guard.grant("p1", ["devices.read"]);
        assert!(guard.revoke("p1"));
        assert!(!guard.is_allowed("p1", "devices.read"));
        assert!(!guard.revoke("p1"));
    }
}
