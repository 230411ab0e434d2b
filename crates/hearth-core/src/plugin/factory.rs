//! `main_class` to constructor lookup.
//!
//! The host registers a constructor per code unit it is willing to run. The
//! core never executes foreign code on its own; the factory is the sandbox
//! boundary.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;

use super::instance::{DynPlugin, Plugin, PluginCapabilities, PluginFault};
use super::manifest::Manifest;
use crate::error::{Error, Result};

/// Builds an instance for a manifest.
pub type PluginConstructor =
    Arc<dyn Fn(&Manifest) -> std::result::Result<DynPlugin, PluginFault> + Send + Sync>;

/// Registry of code units keyed by `main_class`.
#[derive(Default, Clone)]
pub struct PluginFactory {
    constructors: Arc<RwLock<HashMap<String, PluginConstructor>>>,
}

impl PluginFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor. Replaces any previous one for the same class.
    pub fn register<F>(&self, main_class: impl Into<String>, constructor: F)
    where
        F: Fn(&Manifest) -> std::result::Result<DynPlugin, PluginFault> + Send + Sync + 'static,
    {
        let main_class = main_class.into();
        tracing::debug!(main_class = %main_class, "Plugin constructor registered");
        self.constructors
            .write()
            .insert(main_class, Arc::new(constructor));
    }

    /// Register a constructor that cannot fail.
    pub fn register_fn<F, P>(&self, main_class: impl Into<String>, constructor: F)
    where
        F: Fn(&Manifest) -> P + Send + Sync + 'static,
        P: Plugin + 'static,
    {
        self.register(main_class, move |m| Ok(Arc::new(constructor(m)) as DynPlugin));
    }

    pub fn contains(&self, main_class: &str) -> bool {
        self.constructors.read().contains_key(main_class)
    }

    pub fn classes(&self) -> Vec<String> {
        let mut classes: Vec<_> = self.constructors.read().keys().cloned().collect();
        classes.sort();
        classes
    }

    /// Instantiate the code unit named by `manifest.main_class`.
    ///
    /// Constructor errors and panics are both reported as [`Error::Load`].
    pub fn instantiate(&self, manifest: &Manifest) -> Result<DynPlugin> {
        let constructor = self
            .constructors
            .read()
            .get(&manifest.main_class)
            .cloned()
            .ok_or_else(|| {
                Error::load(
                    &manifest.id,
                    format!("no code unit registered for main_class '{}'", manifest.main_class),
                )
            })?;

        let instance = match catch_unwind(AssertUnwindSafe(|| constructor(manifest))) {
            Ok(Ok(instance)) => instance,
            Ok(Err(fault)) => return Err(Error::load(&manifest.id, fault.0)),
            Err(panic) => {
                return Err(Error::load(
                    &manifest.id,
                    format!("constructor panicked: {}", panic_message(panic.as_ref())),
                ))
            }
        };

        let caps = instance.capabilities();
        if !caps.contains(PluginCapabilities::REQUIRED) {
            let missing = PluginCapabilities::REQUIRED.difference(caps);
            return Err(Error::load(
                &manifest.id,
                format!("code unit is missing required entry points: {:?}", missing),
            ));
        }

        Ok(instance)
    }
}

impl std::fmt::Debug for PluginFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginFactory")
            .field("classes", &self.classes())
            .finish()
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
