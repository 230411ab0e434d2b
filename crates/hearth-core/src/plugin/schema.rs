//! Typed configuration schemas declared in plugin manifests.
//!
//! A schema is a flat map of property name to [`PropertySchema`]. The same
//! schema is used twice: once when the manifest is validated (the schema must be
//! well-formed) and again on every config write (the merged document must
//! satisfy it).

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::manifest::FieldProblem;

/// JSON type of a configuration property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
}

impl PropertyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PropertyType::String => "string",
            PropertyType::Number => "number",
            PropertyType::Integer => "integer",
            PropertyType::Boolean => "boolean",
            PropertyType::Array => "array",
            PropertyType::Object => "object",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "string" => Some(PropertyType::String),
            "number" => Some(PropertyType::Number),
            "integer" => Some(PropertyType::Integer),
            "boolean" => Some(PropertyType::Boolean),
            "array" => Some(PropertyType::Array),
            "object" => Some(PropertyType::Object),
            _ => None,
        }
    }

    pub fn matches(&self, value: &Value) -> bool {
        match self {
            PropertyType::String => value.is_string(),
            PropertyType::Number => value.is_number(),
            PropertyType::Integer => match value {
                Value::Number(n) => {
                    n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.fract() == 0.0)
                }
                _ => false,
            },
            PropertyType::Boolean => value.is_boolean(),
            PropertyType::Array => value.is_array(),
            PropertyType::Object => value.is_object(),
        }
    }

    fn is_numeric(&self) -> bool {
        matches!(self, PropertyType::Number | PropertyType::Integer)
    }

    fn has_length(&self) -> bool {
        matches!(self, PropertyType::String | PropertyType::Array)
    }
}

impl fmt::Display for PropertyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One configuration property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertySchema {
    #[serde(rename = "type")]
    pub property_type: PropertyType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,

    /// A required property has no default and must be supplied by the operator.
    #[serde(default)]
    pub required: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,

    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl PropertySchema {
    pub fn new(property_type: PropertyType) -> Self {
        Self {
            property_type,
            default: None,
            required: false,
            minimum: None,
            maximum: None,
            min_length: None,
            max_length: None,
            allowed: None,
            description: None,
        }
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_range(mut self, minimum: Option<f64>, maximum: Option<f64>) -> Self {
        self.minimum = minimum;
        self.maximum = maximum;
        self
    }

    /// Check a single value against type and constraints.
    pub fn check(&self, value: &Value) -> Result<(), String> {
        if !self.property_type.matches(value) {
            return Err(format!(
                "expected {}, got {}",
                self.property_type,
                json_type_name(value)
            ));
        }

        if let Some(n) = value.as_f64() {
            if let Some(min) = self.minimum {
                if n < min {
                    return Err(format!("{} is below minimum {}", n, min));
                }
            }
            if let Some(max) = self.maximum {
                if n > max {
                    return Err(format!("{} is above maximum {}", n, max));
                }
            }
        }

        let len = match value {
            Value::String(s) => Some(s.chars().count()),
            Value::Array(a) => Some(a.len()),
            _ => None,
        };
        if let Some(len) = len {
            if let Some(min) = self.min_length {
                if len < min {
                    return Err(format!("length {} is below min_length {}", len, min));
                }
            }
            if let Some(max) = self.max_length {
                if len > max {
                    return Err(format!("length {} is above max_length {}", len, max));
                }
            }
        }

        if let Some(allowed) = &self.allowed {
            if !allowed.contains(value) {
                return Err(format!("{} is not one of the allowed values", value));
            }
        }

        Ok(())
    }

    /// Parse one raw property, appending every problem under `path`.
    fn parse(raw: &Value, path: &str, problems: &mut Vec<FieldProblem>) -> Option<Self> {
        let Some(obj) = raw.as_object() else {
            problems.push(FieldProblem::new(path, "property must be an object"));
            return None;
        };

        let before = problems.len();

        let property_type = match obj.get("type") {
            None => {
                problems.push(FieldProblem::new(format!("{}.type", path), "missing"));
                None
            }
            Some(Value::String(s)) => match PropertyType::parse(s) {
                Some(t) => Some(t),
                None => {
                    problems.push(FieldProblem::new(
                        format!("{}.type", path),
                        format!("unknown property type '{}'", s),
                    ));
                    None
                }
            },
            Some(_) => {
                problems.push(FieldProblem::new(format!("{}.type", path), "must be a string"));
                None
            }
        };

        let required = match obj.get("required") {
            None | Some(Value::Null) => false,
            Some(Value::Bool(b)) => *b,
            Some(_) => {
                problems.push(FieldProblem::new(
                    format!("{}.required", path),
                    "must be a boolean",
                ));
                false
            }
        };

        let minimum = parse_number(obj.get("minimum"), &format!("{}.minimum", path), problems);
        let maximum = parse_number(obj.get("maximum"), &format!("{}.maximum", path), problems);
        let min_length =
            parse_length(obj.get("min_length"), &format!("{}.min_length", path), problems);
        let max_length =
            parse_length(obj.get("max_length"), &format!("{}.max_length", path), problems);

        let allowed = match obj.get("enum") {
            None | Some(Value::Null) => None,
            Some(Value::Array(values)) if !values.is_empty() => Some(values.clone()),
            Some(_) => {
                problems.push(FieldProblem::new(
                    format!("{}.enum", path),
                    "must be a non-empty array",
                ));
                None
            }
        };

        let description = match obj.get("description") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(_) => {
                problems.push(FieldProblem::new(
                    format!("{}.description", path),
                    "must be a string",
                ));
                None
            }
        };

        let default = obj.get("default").filter(|v| !v.is_null()).cloned();

        if let (Some(min), Some(max)) = (minimum, maximum) {
            if min > max {
                problems.push(FieldProblem::new(
                    path,
                    format!("minimum {} exceeds maximum {}", min, max),
                ));
            }
        }
        if let (Some(min), Some(max)) = (min_length, max_length) {
            if min > max {
                problems.push(FieldProblem::new(
                    path,
                    format!("min_length {} exceeds max_length {}", min, max),
                ));
            }
        }

        let property_type = property_type?;

        if (minimum.is_some() || maximum.is_some()) && !property_type.is_numeric() {
            problems.push(FieldProblem::new(
                path,
                format!("minimum/maximum do not apply to {}", property_type),
            ));
        }
        if (min_length.is_some() || max_length.is_some()) && !property_type.has_length() {
            problems.push(FieldProblem::new(
                path,
                format!("min_length/max_length do not apply to {}", property_type),
            ));
        }

        if required && default.is_some() {
            problems.push(FieldProblem::new(
                format!("{}.default", path),
                "a required property must not declare a default",
            ));
        }

        let prop = PropertySchema {
            property_type,
            default,
            required,
            minimum,
            maximum,
            min_length,
            max_length,
            allowed,
            description,
        };

        if let Some(default) = &prop.default {
            if let Err(msg) = prop.check(default) {
                problems.push(FieldProblem::new(format!("{}.default", path), msg));
            }
        }

        (problems.len() == before).then_some(prop)
    }
}

/// Property name to property definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfigSchema {
    pub properties: BTreeMap<String, PropertySchema>,
}

impl ConfigSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_property(mut self, name: impl Into<String>, prop: PropertySchema) -> Self {
        self.properties.insert(name.into(), prop);
        self
    }

    pub fn get(&self, name: &str) -> Option<&PropertySchema> {
        self.properties.get(name)
    }

    /// Document seeded from declared defaults.
    pub fn defaults(&self) -> Map<String, Value> {
        self.properties
            .iter()
            .filter_map(|(name, prop)| prop.default.clone().map(|v| (name.clone(), v)))
            .collect()
    }

    /// Every way `doc` fails this schema; empty when valid.
    pub fn validate(&self, doc: &Map<String, Value>) -> Vec<FieldProblem> {
        let mut problems = Vec::new();

        for (key, value) in doc {
            match self.properties.get(key) {
                None => problems.push(FieldProblem::new(key.as_str(), "unknown key")),
                Some(prop) => {
                    if let Err(msg) = prop.check(value) {
                        problems.push(FieldProblem::new(key.as_str(), msg));
                    }
                }
            }
        }

        for (name, prop) in &self.properties {
            if prop.required && !doc.contains_key(name) {
                problems.push(FieldProblem::new(name.as_str(), "required"));
            }
        }

        problems
    }

    /// Parse a raw `config_schema` value. Problems are appended with paths
    /// rooted at `config_schema`.
    pub fn parse(raw: &Value, problems: &mut Vec<FieldProblem>) -> Option<Self> {
        const ROOT: &str = "config_schema";

        let Some(obj) = raw.as_object() else {
            problems.push(FieldProblem::new(ROOT, "must be an object"));
            return None;
        };

        let before = problems.len();
        let mut properties = BTreeMap::new();
        for (name, prop) in obj {
            let path = format!("{}.{}", ROOT, name);
            if name.trim().is_empty() {
                problems.push(FieldProblem::new(path, "property name must not be empty"));
                continue;
            }
            if let Some(prop) = PropertySchema::parse(prop, &path, problems) {
                properties.insert(name.clone(), prop);
            }
        }

        (problems.len() == before).then_some(Self { properties })
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }
}

fn parse_number(raw: Option<&Value>, path: &str, problems: &mut Vec<FieldProblem>) -> Option<f64> {
    match raw {
        None | Some(Value::Null) => None,
        Some(v) => match v.as_f64() {
            Some(n) => Some(n),
            None => {
                problems.push(FieldProblem::new(path, "must be a number"));
                None
            }
        },
    }
}

fn parse_length(raw: Option<&Value>, path: &str, problems: &mut Vec<FieldProblem>) -> Option<usize> {
    match raw {
        None | Some(Value::Null) => None,
        Some(v) => match v.as_u64() {
            Some(n) => Some(n as usize),
            None => {
                problems.push(FieldProblem::new(path, "must be a non-negative integer"));
                None
            }
        },
    }
}

pub(crate) fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
