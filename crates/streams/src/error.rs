//! Log-store error model.

use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced by a log-store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connectivity failure (dial, reconnect, broken pipe).
    #[error("store connection error: {0}")]
    Connection(String),

    /// A command was rejected or failed mid-flight.
    #[error("store command error: {0}")]
    Command(String),

    /// Consumer-group registration failed for a reason other than the group
    /// already existing.
    #[error("consumer group error: {0}")]
    ConsumerGroup(String),

    /// An optimistic counter/hash transaction lost to a concurrent writer.
    /// Redelivery retries these; the staged writes are idempotent.
    #[error("optimistic write lost the race: {0}")]
    RaceLost(String),

    /// The store returned a reply the client could not interpret.
    #[error("malformed store reply: {0}")]
    MalformedReply(String),
}

impl StoreError {
    /// Whether redelivery is expected to succeed without intervention.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Command(_) | Self::RaceLost(_)
        )
    }
}
