//! Field types and references.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Declared type of a field's decoded value.
///
/// Validation is structural over the wire token: `Float` accepts any JSON
/// number, `Integer` only integral ones. `Any` opts a field out of
/// validation entirely.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    Integer,
    Float,
    Boolean,
    Text,
    Any,
}

impl FieldType {
    /// Whether a decoded value matches this type. `null` always matches:
    /// absent readings travel as explicit nulls.
    pub fn matches(&self, value: &Value) -> bool {
        if value.is_null() {
            return true;
        }
        match self {
            Self::Integer => value.as_i64().is_some() || value.as_u64().is_some(),
            Self::Float => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Text => value.is_string(),
            Self::Any => true,
        }
    }

    /// Whether a historical array of this base type matches: a JSON array
    /// whose elements each match (holes are nulls).
    pub fn matches_history(&self, value: &Value) -> bool {
        match value {
            Value::Array(items) => items.iter().all(|item| self.matches(item)),
            _ => false,
        }
    }
}

/// Where a dependency or output field takes its value from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldSource {
    /// A field of a declared input kind, read post-split.
    Input { input: String, field: String },
    /// An artificial field, read from its generator output stream. May name
    /// the declaring field itself when the dependency is historical.
    Artificial { field: String },
}

impl FieldSource {
    pub fn input(input: impl Into<String>, field: impl Into<String>) -> Self {
        Self::Input {
            input: input.into(),
            field: field.into(),
        }
    }

    pub fn artificial(field: impl Into<String>) -> Self {
        Self::Artificial {
            field: field.into(),
        }
    }

    /// The field name as it appears on the wire of its source stream.
    pub fn source_key(&self) -> &str {
        match self {
            Self::Input { field, .. } => field,
            Self::Artificial { field } => field,
        }
    }
}

impl std::fmt::Display for FieldSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Input { input, field } => write!(f, "{input}.{field}"),
            Self::Artificial { field } => write!(f, "{field}"),
        }
    }
}
