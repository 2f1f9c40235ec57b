use std::fmt;
use std::sync::Arc;

use serde_json::Value;

/// Custom type check; `Err` carries the description shown in the failure event.
pub type TypeCheckFn = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

/// Runtime type of a step input or output.
///
/// `Nothing` marks ordering-only dependencies: no value flows, so nothing is
/// stored, loaded or checked.
#[derive(Clone, Default)]
pub enum DataType {
    #[default]
    Any,
    Nothing,
    Bool,
    Int,
    Float,
    String,
    List(Box<DataType>),
    Nullable(Box<DataType>),
    Custom {
        name: String,
        check: TypeCheckFn,
    },
}

impl DataType {
    pub fn list(inner: DataType) -> Self {
        Self::List(Box::new(inner))
    }

    pub fn nullable(inner: DataType) -> Self {
        Self::Nullable(Box::new(inner))
    }

    pub fn custom<F>(name: impl Into<String>, check: F) -> Self
    where
        F: Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    {
        Self::Custom {
            name: name.into(),
            check: Arc::new(check),
        }
    }

    pub fn is_nothing(&self) -> bool {
        matches!(self, Self::Nothing)
    }

    pub fn name(&self) -> String {
        match self {
            Self::Any => "Any".to_string(),
            Self::Nothing => "Nothing".to_string(),
            Self::Bool => "Bool".to_string(),
            Self::Int => "Int".to_string(),
            Self::Float => "Float".to_string(),
            Self::String => "String".to_string(),
            Self::List(inner) => format!("[{}]", inner.name()),
            Self::Nullable(inner) => format!("{}?", inner.name()),
            Self::Custom { name, .. } => name.clone(),
        }
    }

    /// Check `value` against this type, describing the first mismatch.
    pub fn type_check(&self, value: &Value) -> Result<(), String> {
        let mismatch = || Err(format!("Value {value} is not of type {}", self.name()));
        match self {
            Self::Any => Ok(()),
            Self::Nothing if value.is_null() => Ok(()),
            Self::Nothing => Err(format!("Value {value} was produced for a Nothing output")),
            Self::Bool if value.is_boolean() => Ok(()),
            Self::Int if value.is_i64() || value.is_u64() => Ok(()),
            Self::Float if value.is_number() => Ok(()),
            Self::String if value.is_string() => Ok(()),
            Self::List(inner) => match value.as_array() {
                Some(items) => items
                    .iter()
                    .enumerate()
                    .try_for_each(|(index, item)| {
                        inner
                            .type_check(item)
                            .map_err(|reason| format!("index {index}: {reason}"))
                    }),
                None => mismatch(),
            },
            Self::Nullable(_) if value.is_null() => Ok(()),
            Self::Nullable(inner) => inner.type_check(value),
            Self::Custom { check, .. } => check(value),
            _ => mismatch(),
        }
    }
}

impl fmt::Debug for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DataType({})", self.name())
    }
}
