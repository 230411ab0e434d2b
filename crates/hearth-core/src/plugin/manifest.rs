//! Plugin manifests and their validation.
//!
//! [`ManifestValidator::validate`] is a pure function from raw JSON to either an
//! accepted [`Manifest`] or a [`ValidationError`] listing every problem found,
//! so an author can fix a manifest in one pass.

use std::collections::HashSet;
use std::fmt;

use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::hooks::HOST_OWNER;
use super::schema::{json_type_name, ConfigSchema};

/// Plugin category declared by the manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginType {
    Device,
    Integration,
    Analytics,
    Automation,
    Utility,
}

impl PluginType {
    pub const ALL: [PluginType; 5] = [
        PluginType::Device,
        PluginType::Integration,
        PluginType::Analytics,
        PluginType::Automation,
        PluginType::Utility,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PluginType::Device => "device",
            PluginType::Integration => "integration",
            PluginType::Analytics => "analytics",
            PluginType::Automation => "automation",
            PluginType::Utility => "utility",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }
}

impl fmt::Display for PluginType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accepted, immutable plugin metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub id: String,
    pub name: String,
    pub version: Version,
    pub author: String,
    pub description: String,
    pub plugin_type: PluginType,
    /// Factory key used to instantiate the code unit.
    pub main_class: String,
    pub api_version: String,

    /// Plugin ids that must be running first, in resolution order.
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Opaque package specifiers forwarded to the installer.
    #[serde(default, alias = "python_dependencies")]
    pub native_dependencies: Vec<String>,

    #[serde(default)]
    pub permissions: Vec<String>,

    /// Hook events the plugin intends to use.
    #[serde(default)]
    pub hooks: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_app_version: Option<Version>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_app_version: Option<Version>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_schema: Option<ConfigSchema>,
}

impl Manifest {
    /// Parse and validate a JSON document.
    pub fn from_json_str(s: &str) -> Result<Self, ValidationError> {
        let raw: Value = serde_json::from_str(s).map_err(|e| ValidationError {
            plugin_id: None,
            problems: vec![FieldProblem::new("$", format!("invalid JSON: {}", e))],
        })?;
        ManifestValidator::validate(&raw)
    }

    pub fn declares_permission(&self, capability: &str) -> bool {
        self.permissions.iter().any(|p| p == capability)
    }
}

/// One missing or malformed manifest field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldProblem {
    /// Dotted path, e.g. `config_schema.threshold.type` or `hooks[2]`.
    pub field: String,
    pub message: String,
}

impl FieldProblem {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// A rejected manifest with all of its problems.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub struct ValidationError {
    /// Present when the `id` field itself was readable.
    pub plugin_id: Option<String>,
    pub problems: Vec<FieldProblem>,
}

impl ValidationError {
    pub fn has_problem(&self, field: &str) -> bool {
        self.problems.iter().any(|p| p.field == field)
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.plugin_id {
            Some(id) => write!(f, "Invalid manifest for {}: ", id)?,
            None => write!(f, "Invalid manifest: ")?,
        }
        let joined = self
            .problems
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        f.write_str(&joined)
    }
}

/// Manifest validation rules.
pub struct ManifestValidator;

impl ManifestValidator {
    /// Validate raw manifest data, collecting every problem.
    pub fn validate(raw: &Value) -> Result<Manifest, ValidationError> {
        let Some(obj) = raw.as_object() else {
            return Err(ValidationError {
                plugin_id: None,
                problems: vec![FieldProblem::new(
                    "$",
                    format!("manifest must be an object, got {}", json_type_name(raw)),
                )],
            });
        };

        let mut problems = Vec::new();

        let id = required_string(obj, "id", &mut problems);
        if let Some(id) = &id {
            if !is_valid_plugin_id(id) {
                problems.push(FieldProblem::new(
                    "id",
                    "must contain only letters, digits, '_', '-' or '.'",
                ));
            } else if RESERVED_PLUGIN_IDS.contains(&id.as_str()) {
                problems.push(FieldProblem::new("id", format!("'{}' is reserved", id)));
            }
        }

        let name = required_string(obj, "name", &mut problems);
        let author = required_string(obj, "author", &mut problems);
        let description = required_string(obj, "description", &mut problems);
        let main_class = required_string(obj, "main_class", &mut problems);

        let version = required_string(obj, "version", &mut problems)
            .and_then(|v| strict_version_field("version", &v, &mut problems));

        let api_version = required_string(obj, "api_version", &mut problems);
        if let Some(api) = &api_version {
            parse_version_field("api_version", api, &mut problems);
        }

        let plugin_type = required_string(obj, "plugin_type", &mut problems).and_then(|t| {
            let parsed = PluginType::parse(&t);
            if parsed.is_none() {
                problems.push(FieldProblem::new(
                    "plugin_type",
                    format!(
                        "'{}' is not one of device, integration, analytics, automation, utility",
                        t
                    ),
                ));
            }
            parsed
        });

        let dependencies = string_list(obj, "dependencies", &mut problems);
        check_unique("dependencies", &dependencies, &mut problems);
        for (i, dep) in dependencies.iter().enumerate() {
            if !is_valid_plugin_id(dep) {
                problems.push(FieldProblem::new(
                    format!("dependencies[{}]", i),
                    format!("'{}' is not a valid plugin id", dep),
                ));
            }
            if id.as_deref() == Some(dep.as_str()) {
                problems.push(FieldProblem::new(
                    format!("dependencies[{}]", i),
                    "a plugin cannot depend on itself",
                ));
            }
        }

        let mut native_dependencies = string_list(obj, "python_dependencies", &mut problems);
        native_dependencies.extend(string_list(obj, "native_dependencies", &mut problems));

        let permissions = identifier_list(obj, "permissions", &mut problems);
        let hooks = identifier_list(obj, "hooks", &mut problems);

        let min_app_version = optional_string(obj, "min_app_version", &mut problems)
            .and_then(|v| parse_version_field("min_app_version", &v, &mut problems));
        let max_app_version = optional_string(obj, "max_app_version", &mut problems)
            .and_then(|v| parse_version_field("max_app_version", &v, &mut problems));
        if let (Some(min), Some(max)) = (&min_app_version, &max_app_version) {
            if min > max {
                problems.push(FieldProblem::new(
                    "max_app_version",
                    format!("{} is lower than min_app_version {}", max, min),
                ));
            }
        }

        let config_schema = match obj.get("config_schema") {
            None | Some(Value::Null) => None,
            Some(raw) => ConfigSchema::parse(raw, &mut problems),
        };

        match (
            id.clone(),
            name,
            version,
            author,
            description,
            plugin_type,
            main_class,
            api_version,
        ) {
            (
                Some(id),
                Some(name),
                Some(version),
                Some(author),
                Some(description),
                Some(plugin_type),
                Some(main_class),
                Some(api_version),
            ) if problems.is_empty() => Ok(Manifest {
                id,
                name,
                version,
                author,
                description,
                plugin_type,
                main_class,
                api_version,
                dependencies,
                native_dependencies,
                permissions,
                hooks,
                min_app_version,
                max_app_version,
                config_schema,
            }),
            _ => Err(ValidationError {
                plugin_id: id,
                problems,
            }),
        }
    }
}

/// `segment(.segment)*` where a segment is `[A-Za-z_][A-Za-z0-9_-]*`.
pub fn is_valid_identifier(s: &str) -> bool {
    !s.is_empty()
        && s.split('.').all(|segment| {
            let mut chars = segment.chars();
            match chars.next() {
                Some(c) if c.is_ascii_alphabetic() || c == '_' => {
                    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
                }
                _ => false,
            }
        })
}

/// Ids owned by the host; no plugin may take them.
pub const RESERVED_PLUGIN_IDS: [&str; 1] = [HOST_OWNER];

pub fn is_valid_plugin_id(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 128
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
}

/// Parse a version, padding missing minor/patch components
/// (`"1.2"` becomes `1.2.0`). Used for `api_version` and the host bounds;
/// the plugin's own `version` must be full semver.
pub fn parse_version(s: &str) -> Result<Version, semver::Error> {
    let s = s.trim();
    if let Ok(v) = Version::parse(s) {
        return Ok(v);
    }

    let split = s.find(['-', '+']).unwrap_or(s.len());
    let (core, rest) = s.split_at(split);
    let padded = match core.split('.').count() {
        1 => format!("{}.0.0{}", core, rest),
        2 => format!("{}.0{}", core, rest),
        _ => s.to_string(),
    };
    Version::parse(&padded)
}

fn parse_version_field(field: &str, s: &str, problems: &mut Vec<FieldProblem>) -> Option<Version> {
    match parse_version(s) {
        Ok(v) => Some(v),
        Err(e) => {
            problems.push(FieldProblem::new(
                field,
                format!("'{}' is not a semantic version: {}", s, e),
            ));
            None
        }
    }
}

fn strict_version_field(field: &str, s: &str, problems: &mut Vec<FieldProblem>) -> Option<Version> {
    match Version::parse(s.trim()) {
        Ok(v) => Some(v),
        Err(e) => {
            problems.push(FieldProblem::new(
                field,
                format!("'{}' is not a semantic version: {}", s, e),
            ));
            None
        }
    }
}

fn required_string(
    obj: &Map<String, Value>,
    field: &str,
    problems: &mut Vec<FieldProblem>,
) -> Option<String> {
    match obj.get(field) {
        None | Some(Value::Null) => {
            problems.push(FieldProblem::new(field, "missing"));
            None
        }
        Some(Value::String(s)) if s.trim().is_empty() => {
            problems.push(FieldProblem::new(field, "must not be empty"));
            None
        }
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => {
            problems.push(FieldProblem::new(
                field,
                format!("expected string, got {}", json_type_name(other)),
            ));
            None
        }
    }
}

fn optional_string(
    obj: &Map<String, Value>,
    field: &str,
    problems: &mut Vec<FieldProblem>,
) -> Option<String> {
    match obj.get(field) {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => {
            problems.push(FieldProblem::new(
                field,
                format!("expected string, got {}", json_type_name(other)),
            ));
            None
        }
    }
}

fn string_list(
    obj: &Map<String, Value>,
    field: &str,
    problems: &mut Vec<FieldProblem>,
) -> Vec<String> {
    match obj.get(field) {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .enumerate()
            .filter_map(|(i, item)| match item {
                Value::String(s) => Some(s.clone()),
                other => {
                    problems.push(FieldProblem::new(
                        format!("{}[{}]", field, i),
                        format!("expected string, got {}", json_type_name(other)),
                    ));
                    None
                }
            })
            .collect(),
        Some(other) => {
            problems.push(FieldProblem::new(
                field,
                format!("expected array, got {}", json_type_name(other)),
            ));
            Vec::new()
        }
    }
}

fn identifier_list(
    obj: &Map<String, Value>,
    field: &str,
    problems: &mut Vec<FieldProblem>,
) -> Vec<String> {
    let items = string_list(obj, field, problems);
    for (i, item) in items.iter().enumerate() {
        if !is_valid_identifier(item) {
            problems.push(FieldProblem::new(
                format!("{}[{}]", field, i),
                format!("'{}' is not a dot-namespaced identifier", item),
            ));
        }
    }
    check_unique(field, &items, problems);
    items
}

fn check_unique(field: &str, items: &[String], problems: &mut Vec<FieldProblem>) {
    let mut seen = HashSet::new();
    for (i, item) in items.iter().enumerate() {
        if !seen.insert(item.as_str()) {
            problems.push(FieldProblem::new(
                format!("{}[{}]", field, i),
                format!("duplicate entry '{}'", item),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid() -> Value {
        json!({
            "id": "thermo",
            "name": "Thermostat Alerts",
            "version": "1.2.0",
            "author": "Hearth",
            "description": "Sends alerts on temperature thresholds",
            "plugin_type": "automation",
            "main_class": "thermo.Alerts",
            "api_version": "1.0",
            "dependencies": ["sensors"],
            "permissions": ["devices.read", "notifications.send"],
            "hooks": ["device.reading"],
            "min_app_version": "0.2",
            "config_schema": {
                "threshold": {"type": "number", "default": 100}
            }
        })
    }

    #[test]
    fn test_accepts_valid_manifest() {
        let manifest = ManifestValidator::validate(&valid()).unwrap();
        assert_eq!(manifest.id, "thermo");
        assert_eq!(manifest.plugin_type, PluginType::Automation);
        assert_eq!(manifest.version, Version::new(1, 2, 0));
        assert_eq!(manifest.min_app_version, Some(Version::new(0, 2, 0)));
        assert!(manifest.declares_permission("devices.read"));
        assert!(!manifest.declares_permission("devices"));
        assert!(manifest.config_schema.is_some());
    }

    #[test]
    fn test_missing_field() {
        let mut raw = valid();
        raw.as_object_mut().unwrap().remove("main_class");
        let err = ManifestValidator::validate(&raw).unwrap_err();
        assert_eq!(err.plugin_id.as_deref(), Some("thermo"));
        assert_eq!(err.problems, vec![FieldProblem::new("main_class", "missing")]);
    }

    #[test]
    fn test_reports_every_problem() {
        let raw = json!({
            "id": "bad id!",
            "version": "one",
            "plugin_type": "widget",
            "permissions": ["devices..read", 7],
            "hooks": ["device.reading", "device.reading"],
            "min_app_version": "2.0.0",
            "max_app_version": "1.0.0",
            "config_schema": {"x": {"type": "number", "required": true, "default": 1}}
        });
        let err = ManifestValidator::validate(&raw).unwrap_err();
        for field in [
            "id",
            "name",
            "author",
            "description",
            "main_class",
            "api_version",
            "version",
            "plugin_type",
            "permissions[0]",
            "permissions[1]",
            "hooks[1]",
            "max_app_version",
            "config_schema.x.default",
        ] {
            assert!(err.has_problem(field), "expected a problem for {}", field);
        }
    }

    #[test]
    fn test_plugin_version_must_be_full_semver() {
        for version in ["1", "1.2", "v1.2.3"] {
            let mut raw = valid();
            raw["version"] = json!(version);
            let err = ManifestValidator::validate(&raw).unwrap_err();
            assert!(err.has_problem("version"), "{} accepted", version);
        }

        let mut raw = valid();
        raw["version"] = json!("1.2.3-rc.1");
        assert!(ManifestValidator::validate(&raw).is_ok());
    }

    #[test]
    fn test_host_owner_id_is_reserved() {
        let mut raw = valid();
        raw["id"] = json!("host");
        let err = ManifestValidator::validate(&raw).unwrap_err();
        assert_eq!(err.problems, vec![FieldProblem::new("id", "'host' is reserved")]);
    }

    #[test]
    fn test_not_an_object() {
        let err = ManifestValidator::validate(&json!([1, 2])).unwrap_err();
        assert_eq!(err.problems.len(), 1);
        assert_eq!(err.problems[0].field, "$");
    }

    #[test]
    fn test_self_dependency() {
        let mut raw = valid();
        raw["dependencies"] = json!(["thermo"]);
        let err = ManifestValidator::validate(&raw).unwrap_err();
        assert!(err.has_problem("dependencies[0]"));
    }

    #[test]
    fn test_native_dependency_aliases() {
        let mut raw = valid();
        raw["python_dependencies"] = json!(["numpy>=1.0"]);
        let manifest = ManifestValidator::validate(&raw).unwrap();
        assert_eq!(manifest.native_dependencies, vec!["numpy>=1.0".to_string()]);
    }

    #[test]
    fn test_identifier_grammar() {
        assert!(is_valid_identifier("device.reading"));
        assert!(is_valid_identifier("my_plugin.custom-event"));
        assert!(is_valid_identifier("system"));
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("device."));
        assert!(!is_valid_identifier(".device"));
        assert!(!is_valid_identifier("1device.x"));
        assert!(!is_valid_identifier("device reading"));
    }

    #[test]
    fn test_lenient_versions() {
        assert_eq!(parse_version("1").unwrap(), Version::new(1, 0, 0));
        assert_eq!(parse_version("1.2").unwrap(), Version::new(1, 2, 0));
        assert_eq!(parse_version("1.2-beta").unwrap().to_string(), "1.2.0-beta");
        assert!(parse_version("one").is_err());
        assert!(parse_version("1.2.3.4").is_err());
    }

    #[test]
    fn test_round_trip_through_serde() {
        let manifest = ManifestValidator::validate(&valid()).unwrap();
        let json = serde_json::to_string(&manifest).unwrap();
        let back: Manifest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, manifest);
    }

    #[test]
    fn test_display() {
        let err = Manifest::from_json_str("{\"id\": \"p\"}").unwrap_err();
        let text = err.to_string();
        assert!(text.starts_with("Invalid manifest for p: "));
        assert!(text.contains("name: missing"));
    }
}
