//! Engine error model.
//!
//! Errors inside a worker loop are caught, logged with context, and leave
//! the message unacknowledged; the log redelivers it. Shutdown is a control
//! signal, not an error, and never travels through these types.

use thiserror::Error;

use streamforge_core::{CoreError, Payload};
use streamforge_model::GeneratorError;
use streamforge_streams::StoreError;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Failures surfaced while driving the pipeline.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Store connectivity or command failure; redelivery retries it.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A payload failed the declared schema. Carries the offending payload
    /// so the defect can be diagnosed from the log line alone.
    #[error("invalid payload: {reason} (payload: {payload:?})")]
    Validation { reason: String, payload: Payload },

    /// User generator code failed.
    #[error(transparent)]
    Generator(#[from] GeneratorError),

    /// A wire contract violation (malformed message id, missing reserved
    /// field) outside a payload-specific context.
    #[error(transparent)]
    Wire(#[from] CoreError),

    /// Consumer-group registration is locked by another process.
    #[error("registration is locked, possibly by another instance; try again later")]
    RegistrationLocked,

    /// Signal-handler installation failed at startup.
    #[error("signal handler setup failed: {0}")]
    Signal(String),
}

impl EngineError {
    pub fn validation(reason: impl Into<String>, payload: &Payload) -> Self {
        Self::Validation {
            reason: reason.into(),
            payload: payload.clone(),
        }
    }

    /// Whether redelivery alone is expected to resolve the failure.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Store(e) => e.is_transient(),
            _ => false,
        }
    }
}
