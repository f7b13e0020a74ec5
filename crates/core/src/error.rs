//! Core error model.

use thiserror::Error;

/// Result type used across the core wire layer.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors produced while interpreting wire data.
///
/// Keep this focused on deterministic contract violations (malformed
/// identifiers, missing reserved fields). Store and scheduling concerns
/// belong to the crates that own them.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A message identifier did not match `{obj_id}:{obj_seq}`.
    #[error("malformed message id: {0:?}")]
    MalformedMessageId(String),

    /// A payload was missing a field the contract requires.
    #[error("missing payload field: {0:?}")]
    MissingField(String),

    /// A configuration value could not be parsed.
    #[error("invalid configuration value for {name}: {value:?}")]
    InvalidConfig { name: &'static str, value: String },
}

impl CoreError {
    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingField(field.into())
    }
}
