//! Config schemas for steps and resources.
//!
//! Resolution walks the provided value and the schema together, fills in
//! defaults and collects every field-level problem instead of stopping at the
//! first one, so a bad run config is reported in a single error.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::error::ConfigFieldError;

/// Declared shape of a config value
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigType {
    Any,
    Bool,
    Int,
    Float,
    String,
    Array(Box<ConfigType>),
    Noneable(Box<ConfigType>),
    Enum(Vec<String>),
    /// Object with exactly the declared fields
    Shape(BTreeMap<String, ConfigField>),
    /// Object with the declared fields plus any others, passed through unchecked
    Permissive(BTreeMap<String, ConfigField>),
}

/// One field of a [`ConfigType::Shape`]
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigField {
    pub config_type: ConfigType,
    pub required: bool,
    pub default: Option<Value>,
    pub description: Option<String>,
}

impl ConfigField {
    pub fn required(config_type: ConfigType) -> Self {
        Self {
            config_type,
            required: true,
            default: None,
            description: None,
        }
    }

    pub fn optional(config_type: ConfigType) -> Self {
        Self {
            required: false,
            ..Self::required(config_type)
        }
    }

    pub fn with_default(config_type: ConfigType, default: Value) -> Self {
        Self {
            required: false,
            default: Some(default),
            ..Self::required(config_type)
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

impl ConfigType {
    pub fn shape<I, K>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, ConfigField)>,
        K: Into<String>,
    {
        Self::Shape(fields.into_iter().map(|(k, f)| (k.into(), f)).collect())
    }

    pub fn array(inner: ConfigType) -> Self {
        Self::Array(Box::new(inner))
    }

    pub fn noneable(inner: ConfigType) -> Self {
        Self::Noneable(Box::new(inner))
    }

    /// Resolve `value` against the schema, appending problems to `errors`.
    ///
    /// Returns the value with defaults applied; when errors were recorded the
    /// returned value is only partially meaningful and must be discarded.
    pub fn resolve(
        &self,
        value: Option<&Value>,
        path: &str,
        errors: &mut Vec<ConfigFieldError>,
    ) -> Value {
        match (self, value) {
            (Self::Noneable(_), None | Some(Value::Null)) => Value::Null,
            (Self::Noneable(inner), Some(_)) => inner.resolve(value, path, errors),
            (Self::Shape(fields) | Self::Permissive(fields), None | Some(Value::Null)) => {
                self.resolve_object(fields, &Map::new(), path, errors)
            }
            (Self::Any, Some(v)) => v.clone(),
            (Self::Any, None) => Value::Null,
            (_, None) => reject(errors, path, "missing value".to_string()),
            (Self::Bool, Some(v @ Value::Bool(_))) => v.clone(),
            (Self::Int, Some(v)) if v.is_i64() || v.is_u64() => v.clone(),
            (Self::Float, Some(v @ Value::Number(_))) => v.clone(),
            (Self::String, Some(v @ Value::String(_))) => v.clone(),
            (Self::Enum(options), Some(Value::String(s))) => {
                if options.contains(s) {
                    Value::String(s.clone())
                } else {
                    reject(errors, path, format!("'{s}' is not one of {options:?}"))
                }
            }
            (Self::Array(inner), Some(Value::Array(items))) => Value::Array(
                items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| inner.resolve(Some(item), &format!("{path}[{i}]"), errors))
                    .collect(),
            ),
            (Self::Shape(fields) | Self::Permissive(fields), Some(Value::Object(provided))) => {
                self.resolve_object(fields, provided, path, errors)
            }
            (expected, Some(v)) => reject(
                errors,
                path,
                format!("expected {}, got {v}", expected.type_name()),
            ),
        }
    }

    fn resolve_object(
        &self,
        fields: &BTreeMap<String, ConfigField>,
        provided: &Map<String, Value>,
        path: &str,
        errors: &mut Vec<ConfigFieldError>,
    ) -> Value {
        let mut resolved = Map::new();

        for (name, field) in fields {
            let field_path = join_path(path, name);
            match provided.get(name) {
                Some(value) => {
                    resolved.insert(
                        name.clone(),
                        field.config_type.resolve(Some(value), &field_path, errors),
                    );
                }
                None => match &field.default {
                    Some(default) => {
                        resolved.insert(name.clone(), default.clone());
                    }
                    None if field.required && field.config_type.requires_value() => {
                        errors.push(ConfigFieldError {
                            path: field_path,
                            reason: format!("missing required field '{name}'"),
                        });
                    }
                    None => {
                        if let Self::Shape(_) | Self::Permissive(_) = field.config_type {
                            resolved.insert(
                                name.clone(),
                                field.config_type.resolve(None, &field_path, errors),
                            );
                        }
                    }
                },
            }
        }

        for (name, value) in provided {
            if fields.contains_key(name) {
                continue;
            }
            match self {
                Self::Permissive(_) => {
                    resolved.insert(name.clone(), value.clone());
                }
                _ => errors.push(ConfigFieldError {
                    path: join_path(path, name),
                    reason: format!("unexpected field '{name}'"),
                }),
            }
        }

        Value::Object(resolved)
    }

    /// Whether an absent value is an error.
    ///
    /// Shapes whose fields all have defaults or are optional can be omitted.
    pub fn requires_value(&self) -> bool {
        match self {
            Self::Noneable(_) | Self::Any => false,
            Self::Shape(fields) | Self::Permissive(fields) => fields
                .values()
                .any(|f| f.required && f.default.is_none() && f.config_type.requires_value()),
            _ => true,
        }
    }

    fn type_name(&self) -> String {
        match self {
            Self::Any => "Any".to_string(),
            Self::Bool => "Bool".to_string(),
            Self::Int => "Int".to_string(),
            Self::Float => "Float".to_string(),
            Self::String => "String".to_string(),
            Self::Array(inner) => format!("[{}]", inner.type_name()),
            Self::Noneable(inner) => format!("{}?", inner.type_name()),
            Self::Enum(_) => "Enum".to_string(),
            Self::Shape(_) | Self::Permissive(_) => "object".to_string(),
        }
    }
}

fn reject(errors: &mut Vec<ConfigFieldError>, path: &str, reason: String) -> Value {
    errors.push(ConfigFieldError {
        path: path.to_string(),
        reason,
    });
    Value::Null
}

fn join_path(path: &str, name: &str) -> String {
    if path.is_empty() {
        name.to_string()
    } else {
        format!("{path}.{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn limits_schema() -> ConfigType {
        ConfigType::shape([
            ("limit", ConfigField::required(ConfigType::Int)),
            ("mode", ConfigField::with_default(
                ConfigType::Enum(vec!["fast".into(), "safe".into()]),
                json!("safe"),
            )),
            ("tags", ConfigField::optional(ConfigType::array(ConfigType::String))),
        ])
    }

    #[test]
    fn test_defaults_are_applied() {
        let mut errors = Vec::new();
        let resolved = limits_schema().resolve(Some(&json!({"limit": 3})), "ops.a.config", &mut errors);
        assert!(errors.is_empty());
        assert_eq!(resolved, json!({"limit": 3, "mode": "safe"}));
    }

    #[test]
    fn test_every_problem_is_reported() {
        let mut errors = Vec::new();
        limits_schema().resolve(
            Some(&json!({"mode": "reckless", "tags": ["a", 1], "extra": true})),
            "ops.a.config",
            &mut errors,
        );
        let paths: Vec<&str> = errors.iter().map(|e| e.path.as_str()).collect();
        assert!(paths.contains(&"ops.a.config.limit"));
        assert!(paths.contains(&"ops.a.config.mode"));
        assert!(paths.contains(&"ops.a.config.tags[1]"));
        assert!(paths.contains(&"ops.a.config.extra"));
        assert_eq!(errors.len(), 4);
    }

    #[test]
    fn test_permissive_passes_unknown_fields() {
        let schema = ConfigType::Permissive(BTreeMap::new());
        let mut errors = Vec::new();
        let resolved = schema.resolve(Some(&json!({"anything": 1})), "resources.db.config", &mut errors);
        assert!(errors.is_empty());
        assert_eq!(resolved, json!({"anything": 1}));
    }

    #[test]
    fn test_omitted_shape_with_defaults_resolves() {
        let schema = ConfigType::shape([("retries", ConfigField::with_default(ConfigType::Int, json!(2)))]);
        assert!(!schema.requires_value());
        let mut errors = Vec::new();
        assert_eq!(schema.resolve(None, "x", &mut errors), json!({"retries": 2}));
        assert!(errors.is_empty());
    }
}
