//! Model compilation errors.
//!
//! Everything here is fatal and reported before any stage starts; a model
//! that compiles runs without further configuration checks.

use thiserror::Error;

/// A defect in the declared model.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("duplicate input {0:?}")]
    DuplicateInput(String),

    #[error("duplicate artificial field {0:?}")]
    DuplicateArtificialField(String),

    #[error("duplicate output {0:?}")]
    DuplicateOutput(String),

    #[error("input {input:?} declares id_field {id_field:?} which is not one of its fields")]
    MissingIdField { input: String, id_field: String },

    #[error("{context}: reference to unknown field {reference:?}")]
    UnknownReference { context: String, reference: String },

    #[error("two stages share the consumer group {0:?}")]
    DuplicateGroup(String),

    #[error("dependency {param:?} of {field:?} declares history_length 0; minimum is 1")]
    EmptyHistory { field: String, param: String },

    #[error("artificial field {field:?} declares parameter {param:?} twice")]
    DuplicateParameter { field: String, param: String },

    #[error("worker_config names unknown consumer group {0:?}")]
    UnknownWorkerGroup(String),

    #[error(
        "artificial field {field:?} depends on its own current value; \
         self-references must be historical"
    )]
    SelfDependencyMustBeHistorical { field: String },
}
