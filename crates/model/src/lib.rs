//! Declarative model of a stream-processing pipeline.
//!
//! A model names typed input kinds, artificial (derived) fields with their
//! generators and dependencies, and output reports gathering both. The
//! compiler turns a model into a validated [`compiler::Topology`]: the
//! concrete stage instances and stream bindings the engine runs.

pub mod compiler;
pub mod error;
pub mod field;
pub mod generator;
pub mod spec;

pub use compiler::{
    DependencySpec, GeneratorDep, GeneratorSpec, ResolverSpec, SplitterSpec, StageSpec,
    Topology, compile,
};
pub use error::ModelError;
pub use field::{FieldSource, FieldType};
pub use generator::{DepRecord, GeneratorContext, GeneratorError, GeneratorFn};
pub use spec::{
    ArtificialFieldSpec, DepSpec, FieldSpec, InputSpec, ModelSpec, OutputFieldSpec, OutputSpec,
};
