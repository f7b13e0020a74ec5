//! Pipeline supervisor binary: compiles the demo vehicle-telemetry model
//! and runs its worker DAG against Redis. First SIGINT/SIGTERM drains the
//! pipeline; a second one aborts in-flight work.

use std::sync::Arc;

use streamforge_core::Config;
use streamforge_engine::Supervisor;
use streamforge_model::compile;
use streamforge_streams::RedisStore;

mod demo;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    streamforge_observability::init();

    let config = Config::from_env()?;
    let topology = compile(demo::model(), &config)?;
    let store = Arc::new(RedisStore::connect(&config.redis_uri).await?);

    tracing::info!(
        redis = %config.redis_uri,
        stages = topology.stages.len(),
        "starting pipeline"
    );
    Supervisor::new(config, store, topology).run().await?;
    Ok(())
}
