//! Runtime stages: the tagged processing units of the compiled pipeline.
//!
//! Each stage owns its consumer group and the streams it reads; a stage's
//! `handle` processes one delivered entry end-to-end, including the
//! acknowledgement, which every stage commits atomically with its output.
//! Workers (see [`crate::worker`]) drive stages; stages never fetch.

use std::sync::Arc;

use async_trait::async_trait;

use streamforge_core::{Config, KeySpace};
use streamforge_model::StageSpec;
use streamforge_streams::{StreamEntry, StreamStore};

use crate::error::EngineResult;

mod generator;
mod resolver;
mod splitter;

pub use generator::GeneratorStage;
pub use resolver::ResolverStage;
pub use splitter::SplitterStage;

/// How a worker schedules a stage's handler.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DispatchMode {
    /// Suspendable handler; the whole fetched batch runs concurrently.
    Cooperative,
    /// Handler blocks a thread; runs on a bounded pool.
    Blocking,
    /// One message at a time.
    Sequential,
}

/// A single-role processing unit with one consumer group.
#[async_trait]
pub trait StageHandler: Send + Sync + 'static {
    /// Consumer group this stage reads as.
    fn group(&self) -> &str;

    /// Streams the stage consumes.
    fn input_streams(&self) -> &[String];

    fn dispatch(&self) -> DispatchMode;

    /// Process one delivered entry. On `Ok` the entry has been acknowledged
    /// (stages bundle the ack with their output commit); on `Err` it stays
    /// pending and the log redelivers it.
    async fn handle(&self, entry: StreamEntry) -> EngineResult<()>;
}

/// Instantiate the runtime stage for one compiled stage spec.
pub fn build_stage(
    spec: StageSpec,
    store: Arc<dyn StreamStore>,
    config: &Config,
) -> Arc<dyn StageHandler> {
    let keyspace = KeySpace::new(config);
    match spec {
        StageSpec::Splitter(spec) => Arc::new(SplitterStage::new(spec, store, keyspace)),
        StageSpec::Resolver(spec) => Arc::new(ResolverStage::new(spec, store, keyspace)),
        StageSpec::Generator(spec) => Arc::new(GeneratorStage::new(
            spec,
            store,
            keyspace,
            config.read_chunk_length,
        )),
    }
}
