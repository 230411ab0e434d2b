//! Dependency resolution, host compatibility and instantiation.

use semver::Version;

use super::factory::PluginFactory;
use super::instance::DynPlugin;
use super::manifest::{parse_version, Manifest};
use super::registry::PluginRegistry;
use super::state::PluginState;
use crate::error::{Error, Result};

/// Resolves what a manifest needs and builds its instance.
#[derive(Debug, Clone)]
pub struct PluginLoader {
    factory: PluginFactory,
    host_version: Version,
    api_version: Version,
}

impl PluginLoader {
    pub fn new(factory: PluginFactory, host_version: &str, api_version: &str) -> Result<Self> {
        let host_version = parse_version(host_version)
            .map_err(|e| Error::Config(format!("invalid host_version '{}': {}", host_version, e)))?;
        let api_version = parse_version(api_version)
            .map_err(|e| Error::Config(format!("invalid api_version '{}': {}", api_version, e)))?;
        Ok(Self {
            factory,
            host_version,
            api_version,
        })
    }

    pub fn factory(&self) -> &PluginFactory {
        &self.factory
    }

    pub fn host_version(&self) -> &Version {
        &self.host_version
    }

    /// Host version within `[min_app_version, max_app_version]` and the same
    /// plugin API major version.
    pub fn check_compatibility(&self, manifest: &Manifest) -> Result<()> {
        if let Some(min) = &manifest.min_app_version {
            if &self.host_version < min {
                return Err(Error::load(
                    &manifest.id,
                    format!("requires host >= {}, running {}", min, self.host_version),
                ));
            }
        }
        if let Some(max) = &manifest.max_app_version {
            if &self.host_version > max {
                return Err(Error::load(
                    &manifest.id,
                    format!("requires host <= {}, running {}", max, self.host_version),
                ));
            }
        }

        let api = parse_version(&manifest.api_version).map_err(|e| {
            Error::load(
                &manifest.id,
                format!("invalid api_version '{}': {}", manifest.api_version, e),
            )
        })?;
        if api.major != self.api_version.major {
            return Err(Error::load(
                &manifest.id,
                format!(
                    "plugin API {} is incompatible with host API {}",
                    manifest.api_version, self.api_version
                ),
            ));
        }
        Ok(())
    }

    /// Every declared dependency must be `running`, checked in declaration
    /// order. The first unsatisfied one is reported.
    pub async fn check_dependencies(
        &self,
        manifest: &Manifest,
        registry: &PluginRegistry,
    ) -> Result<()> {
        for dep in &manifest.dependencies {
            let status = match registry.get(dep).await {
                Ok(record) if record.state == PluginState::Running => continue,
                Ok(record) => record.state.to_string(),
                Err(Error::NotFound(_)) => "not registered".to_string(),
                Err(e) => return Err(e),
            };
            return Err(Error::Dependency {
                plugin: manifest.id.clone(),
                dependency: dep.clone(),
                status,
            });
        }
        Ok(())
    }

    /// Compatibility, dependencies, then instantiation.
    pub async fn load(&self, manifest: &Manifest, registry: &PluginRegistry) -> Result<DynPlugin> {
        self.check_compatibility(manifest)?;
        self.check_dependencies(manifest, registry).await?;
        let instance = self.factory.instantiate(manifest)?;
        tracing::debug!(plugin_id = %manifest.id, main_class = %manifest.main_class, "Code unit instantiated");
        Ok(instance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::manifest::ManifestValidator;
    use serde_json::json;

    fn manifest(extra: serde_json::Value) -> Manifest {
        let mut raw = json!({
            "id": "p2",
            "name": "P2",
            "version": "1.0.0",
            "author": "a",
            "description": "d",
            "plugin_type": "analytics",
            "main_class": "noop",
            "api_version": "1.0"
        });
        for (k, v) in extra.as_object().unwrap() {
            raw[k] = v.clone();
        }
        ManifestValidator::validate(&raw).unwrap()
    }

    fn loader() -> PluginLoader {
        PluginLoader::new(PluginFactory::new(), "0.3.0", "1.0").unwrap()
    }

    #[test]
    fn test_host_version_range() {
        let loader = loader();
        assert!(loader.check_compatibility(&manifest(json!({}))).is_ok());
        assert!(loader
            .check_compatibility(&manifest(json!({"min_app_version": "0.2", "max_app_version": "0.3.5"})))
            .is_ok());

        let err = loader
            .check_compatibility(&manifest(json!({"min_app_version": "0.4"})))
            .unwrap_err();
        assert!(matches!(err, Error::Load { .. }));
        assert!(loader
            .check_compatibility(&manifest(json!({"max_app_version": "0.2.9"})))
            .is_err());
    }

    #[test]
    fn test_api_major_mismatch() {
        let err = loader()
            .check_compatibility(&manifest(json!({"api_version": "2.0"})))
            .unwrap_err();
        assert!(err.to_string().contains("incompatible"));
    }

    #[tokio::test]
    async fn test_dependency_not_running() {
        let registry = PluginRegistry::in_memory();
        let loader = loader();

        let m = manifest(json!({"dependencies": ["p1", "p0"]}));
        let err = loader.check_dependencies(&m, &registry).await.unwrap_err();
        match err {
            Error::Dependency { dependency, status, .. } => {
                assert_eq!(dependency, "p1");
                assert_eq!(status, "not registered");
            }
            other => panic!("unexpected error: {other}"),
        }

        let mut p1 = manifest(json!({}));
        p1.id = "p1".into();
        registry.register(p1).await.unwrap();
        let err = loader.check_dependencies(&m, &registry).await.unwrap_err();
        assert!(err.to_string().contains("p1, which is discovered"));
    }

    #[test]
    fn test_invalid_host_version() {
        assert!(PluginLoader::new(PluginFactory::new(), "banana", "1.0").is_err());
    }
}
