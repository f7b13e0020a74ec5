//! Pipeline supervisor: group registration, worker spawning, shutdown.
//!
//! The supervisor owns the compiled topology. It registers every consumer
//! group under a TTL-bounded advisory lock (so two instances rewriting
//! registrations cannot interleave, and a crashed holder cannot wedge the
//! next one), spawns N worker tasks per stage, and coordinates shutdown:
//! the first SIGINT/SIGTERM drains, a second one aborts in-flight work.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use streamforge_core::{Config, KeySpace, naming::REGISTER_LOCK_KEY};
use streamforge_model::{StageSpec, Topology};
use streamforge_streams::StreamStore;

use crate::error::{EngineError, EngineResult};
use crate::stages::build_stage;
use crate::worker::{StageWorker, WorkerOptions};

/// How long the registration lock may be held before it expires on its own.
const REGISTRATION_LOCK_TTL: Duration = Duration::from_secs(5);

/// Runs a compiled topology against a store.
pub struct Supervisor {
    config: Config,
    store: Arc<dyn StreamStore>,
    topology: Topology,
    options: WorkerOptions,
}

impl Supervisor {
    pub fn new(config: Config, store: Arc<dyn StreamStore>, topology: Topology) -> Self {
        let options = WorkerOptions::from_config(&config);
        Self {
            config,
            store,
            topology,
            options,
        }
    }

    pub fn with_options(mut self, options: WorkerOptions) -> Self {
        self.options = options;
        self
    }

    /// Register every stage's consumer groups, serialized by the advisory
    /// registration lock. Fails fast if another instance holds the lock.
    pub async fn register(&self) -> EngineResult<()> {
        if !self
            .store
            .try_lock(REGISTER_LOCK_KEY, REGISTRATION_LOCK_TTL)
            .await?
        {
            return Err(EngineError::RegistrationLocked);
        }
        let result = self.register_groups().await;
        if let Err(error) = self.store.unlock(REGISTER_LOCK_KEY).await {
            // The TTL reclaims it; the next holder just waits a little.
            warn!(%error, "failed to release registration lock");
        }
        result
    }

    async fn register_groups(&self) -> EngineResult<()> {
        for stage in &self.topology.stages {
            let (group, streams) = stage_bindings(stage);
            for stream in streams {
                self.store
                    .ensure_group(&stream, group, self.options.read_start)
                    .await?;
                debug!(group, stream = %stream, "registered consumer group");
            }
        }
        Ok(())
    }

    /// Spawn every stage's workers, sharing one shutdown flag.
    fn spawn_workers(&self, shutdown: &watch::Receiver<bool>) -> JoinSet<EngineResult<()>> {
        let keyspace = KeySpace::new(&self.config);
        let mut tasks = JoinSet::new();
        let mut total = 0;
        for spec in &self.topology.stages {
            let workers = spec.workers();
            let handler = build_stage(spec.clone(), self.store.clone(), &self.config);
            for _ in 0..workers {
                let worker = StageWorker::new(
                    handler.clone(),
                    self.store.clone(),
                    keyspace.clone(),
                    self.options.clone(),
                );
                tasks.spawn(worker.run(shutdown.clone()));
            }
            total += workers;
        }
        info!(
            stages = self.topology.stages.len(),
            workers = total,
            "pipeline workers spawned"
        );
        tasks
    }

    /// Run until the provided shutdown flag flips and every worker drains.
    /// This is the embedding/test entry point; [`Supervisor::run`] adds OS
    /// signal handling on top.
    pub async fn run_with_shutdown(
        &self,
        shutdown: watch::Receiver<bool>,
    ) -> EngineResult<()> {
        self.register().await?;
        let mut tasks = self.spawn_workers(&shutdown);
        while let Some(joined) = tasks.join_next().await {
            log_worker_exit(joined);
        }
        Ok(())
    }

    /// Run under OS signal control: the first SIGINT/SIGTERM drains the
    /// pipeline, a second one aborts in-flight work.
    pub async fn run(self) -> EngineResult<()> {
        self.register().await?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = self.spawn_workers(&shutdown_rx);
        let mut signals = Signals::install()?;
        let mut draining = false;

        loop {
            tokio::select! {
                _ = signals.recv() => {
                    if draining {
                        warn!("second signal; aborting in-flight work");
                        tasks.abort_all();
                        break;
                    }
                    info!("shutdown requested; draining");
                    draining = true;
                    let _ = shutdown_tx.send(true);
                }
                joined = tasks.join_next() => match joined {
                    Some(joined) => log_worker_exit(joined),
                    None => break,
                }
            }
        }
        while let Some(joined) = tasks.join_next().await {
            log_worker_exit(joined);
        }
        info!("pipeline stopped");
        Ok(())
    }
}

fn stage_bindings(stage: &StageSpec) -> (&str, Vec<String>) {
    match stage {
        StageSpec::Splitter(s) => (&s.group, vec![s.input_stream.clone()]),
        StageSpec::Resolver(s) => (&s.group, s.input_streams()),
        StageSpec::Generator(s) => (&s.group, vec![s.input_stream.clone()]),
    }
}

fn log_worker_exit(joined: Result<EngineResult<()>, tokio::task::JoinError>) {
    match joined {
        Ok(Ok(())) => {}
        Ok(Err(error)) => warn!(%error, "worker exited with error"),
        Err(error) if error.is_cancelled() => debug!("worker aborted"),
        Err(error) => warn!(%error, "worker panicked"),
    }
}

/// OS shutdown signals, unified across platforms.
struct Signals {
    #[cfg(unix)]
    interrupt: tokio::signal::unix::Signal,
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
}

impl Signals {
    fn install() -> EngineResult<Self> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            Ok(Self {
                interrupt: signal(SignalKind::interrupt())
                    .map_err(|e| EngineError::Signal(e.to_string()))?,
                terminate: signal(SignalKind::terminate())
                    .map_err(|e| EngineError::Signal(e.to_string()))?,
            })
        }
        #[cfg(not(unix))]
        {
            Ok(Self {})
        }
    }

    async fn recv(&mut self) {
        #[cfg(unix)]
        {
            tokio::select! {
                _ = self.interrupt.recv() => {}
                _ = self.terminate.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use streamforge_core::ReadStart;
    use streamforge_model::{
        ArtificialFieldSpec, DepSpec, FieldSource, FieldType, GeneratorFn, InputSpec,
        ModelSpec, OutputSpec, compile,
    };
    use streamforge_streams::InMemoryStore;

    use super::*;

    fn model() -> ModelSpec {
        ModelSpec::new()
            .with_input(
                InputSpec::new("test", "vehicle_id")
                    .with_field("vehicle_id", FieldType::Text)
                    .with_field("a", FieldType::Integer),
            )
            .with_artificial_field(
                ArtificialFieldSpec::new(
                    "double",
                    GeneratorFn::cooperative(|ctx: streamforge_model::GeneratorContext| async move {
                        Ok(serde_json::json!(ctx.deps.i64("a")? * 2))
                    }),
                    FieldType::Integer,
                )
                .with_dep(DepSpec::current("a", FieldSource::input("test", "a"))),
            )
            .with_output(
                OutputSpec::new("doubled")
                    .with_field("double", FieldSource::artificial("double")),
            )
    }

    fn supervisor(store: Arc<InMemoryStore>) -> Supervisor {
        let config = Config::default();
        let topology = compile(model(), &config).unwrap();
        let mut options = WorkerOptions::from_config(&config);
        options.block = Duration::from_millis(20);
        options.read_start = ReadStart::Beginning;
        options.claim_idle = Duration::ZERO;
        Supervisor::new(config, store, topology).with_options(options)
    }

    #[tokio::test]
    async fn register_takes_and_releases_the_lock() {
        let store = Arc::new(InMemoryStore::new());
        let supervisor = supervisor(store.clone());
        supervisor.register().await.unwrap();
        // The lock was released: a second registration pass succeeds.
        supervisor.register().await.unwrap();
    }

    #[tokio::test]
    async fn register_fails_fast_when_locked() {
        let store = Arc::new(InMemoryStore::new());
        let supervisor = supervisor(store.clone());
        assert!(store
            .try_lock(REGISTER_LOCK_KEY, Duration::from_secs(5))
            .await
            .unwrap());
        assert!(matches!(
            supervisor.register().await.unwrap_err(),
            EngineError::RegistrationLocked
        ));
    }

    #[tokio::test]
    async fn pipeline_runs_end_to_end_and_drains() {
        let store = Arc::new(InMemoryStore::new());
        let supervisor = supervisor(store.clone());

        for i in 0..5 {
            let mut payload = streamforge_core::Payload::new();
            payload.insert("vehicle_id", "\"V1\"");
            payload.insert("a", i.to_string());
            store.append(":test", payload).await.unwrap();
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let run = tokio::spawn(async move { supervisor.run_with_shutdown(shutdown_rx).await });

        for _ in 0..200 {
            if store.stream_len(":doubled").await.unwrap() == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        shutdown_tx.send(true).unwrap();
        run.await.unwrap().unwrap();

        let out = store.read_after(":doubled", None, 10).await.unwrap();
        assert_eq!(out.len(), 5);
        let mut doubled: Vec<i64> = out
            .iter()
            .map(|e| e.payload.get("double").unwrap().parse().unwrap())
            .collect();
        doubled.sort_unstable();
        assert_eq!(doubled, vec![0, 2, 4, 6, 8]);
    }
}
