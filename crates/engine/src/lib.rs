//! The stream-processing engine: runtime stages and their worker harness.
//!
//! A compiled [`streamforge_model::Topology`] becomes a set of stages
//! (splitter, dependency resolver, field generator), each driven by N
//! consumer-group workers under a [`supervisor::Supervisor`]. Delivery is
//! at-least-once end to end; every stage commits its output atomically with
//! the acknowledgement of the input that produced it, and every consumer of
//! a terminal stream must be idempotent on the reserved message id.

pub mod error;
pub mod stages;
pub mod supervisor;
pub mod worker;

pub use error::{EngineError, EngineResult};
pub use stages::{DispatchMode, GeneratorStage, ResolverStage, SplitterStage, StageHandler, build_stage};
pub use supervisor::Supervisor;
pub use worker::{StageState, StageWorker, WorkerOptions};
