//! Stage workers: the read–dispatch loop around a stage handler.
//!
//! Each worker is one consumer inside its stage's group. The loop block-reads
//! a chunk, dispatches entries per the stage's [`DispatchMode`], and leaves
//! acknowledgement to the handler (which commits it atomically with its
//! output). Handler failures are logged and the entry stays pending; a
//! periodic claim pass rescues entries abandoned by crashed workers.
//!
//! State machine per worker: `Created → Registered → Running → Draining →
//! Stopped`. Flipping the shared shutdown flag moves a worker to `Draining`:
//! it stops fetching, lets in-flight handlers finish, and stops.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use streamforge_core::{Config, KeySpace, Payload, ReadStart};
use streamforge_streams::{StreamEntry, StreamStore};

use crate::error::EngineResult;
use crate::stages::{DispatchMode, StageHandler};

/// Pause after a failed fetch before trying again.
const FETCH_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Lifecycle of one worker.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StageState {
    Created,
    Registered,
    Running,
    Draining,
    Stopped,
}

/// Worker-loop tuning, taken from [`Config`] unless overridden.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Messages fetched per read.
    pub chunk_length: usize,
    /// Block timeout of each read; bounds shutdown latency.
    pub block: Duration,
    /// Idle time before another worker's pending entry is claimed. Zero
    /// disables the claim pass.
    pub claim_idle: Duration,
    /// Start cursor for group registration.
    pub read_start: ReadStart,
    /// When set, entries delivered more than this many times are routed to
    /// the stage's dead-letter stream instead of dispatched. Default is to
    /// redeliver forever.
    pub max_deliveries: Option<u64>,
}

impl WorkerOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            chunk_length: config.read_chunk_length,
            block: config.read_block,
            claim_idle: config.claim_idle,
            read_start: config.read_start,
            max_deliveries: None,
        }
    }
}

/// One worker driving one stage handler.
pub struct StageWorker {
    handler: Arc<dyn StageHandler>,
    store: Arc<dyn StreamStore>,
    keyspace: KeySpace,
    options: WorkerOptions,
    consumer: String,
    state_tx: watch::Sender<StageState>,
}

impl StageWorker {
    pub fn new(
        handler: Arc<dyn StageHandler>,
        store: Arc<dyn StreamStore>,
        keyspace: KeySpace,
        options: WorkerOptions,
    ) -> Self {
        let (state_tx, _) = watch::channel(StageState::Created);
        Self {
            handler,
            store,
            keyspace,
            options,
            consumer: format!("worker-{}", Uuid::now_v7()),
            state_tx,
        }
    }

    /// Observe this worker's lifecycle.
    pub fn state(&self) -> watch::Receiver<StageState> {
        self.state_tx.subscribe()
    }

    /// Unique consumer name within the stage's group.
    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    fn set_state(&self, state: StageState) {
        let _ = self.state_tx.send(state);
    }

    /// Register the stage's consumer group on every input stream.
    pub async fn register(&self) -> EngineResult<()> {
        for stream in self.handler.input_streams() {
            self.store
                .ensure_group(stream, self.handler.group(), self.options.read_start)
                .await?;
        }
        self.set_state(StageState::Registered);
        Ok(())
    }

    /// Run until the shutdown flag flips, then drain and stop.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> EngineResult<()> {
        self.register().await?;
        self.set_state(StageState::Running);
        info!(
            group = self.handler.group(),
            consumer = %self.consumer,
            streams = ?self.handler.input_streams(),
            "worker running"
        );

        match self.handler.dispatch() {
            DispatchMode::Sequential => self.run_sequential(shutdown).await,
            DispatchMode::Cooperative | DispatchMode::Blocking => {
                self.run_concurrent(shutdown).await
            }
        }

        self.set_state(StageState::Stopped);
        info!(group = self.handler.group(), consumer = %self.consumer, "worker stopped");
        Ok(())
    }

    /// Concurrent dispatch with the half-done top-up rule: the whole fetch is
    /// scheduled at once, and once the batch is at least half complete the
    /// next fetch tops it back up to `chunk_length` in-flight handlers.
    async fn run_concurrent(&self, shutdown: watch::Receiver<bool>) {
        let chunk = self.options.chunk_length.max(1);
        let mut in_flight: JoinSet<()> = JoinSet::new();
        let mut last_claim = Instant::now();

        while !*shutdown.borrow() {
            while let Some(joined) = in_flight.try_join_next() {
                log_joined(joined);
            }
            if in_flight.len() > chunk / 2 {
                if let Some(joined) = in_flight.join_next().await {
                    log_joined(joined);
                }
                continue;
            }

            let count = chunk - in_flight.len();
            for entry in self.fetch(count, &mut last_claim).await {
                if self.route_to_dlq(&entry).await {
                    continue;
                }
                let handler = self.handler.clone();
                in_flight.spawn(async move {
                    dispatch_one(handler, entry).await;
                });
            }
        }

        self.set_state(StageState::Draining);
        debug!(group = self.handler.group(), in_flight = in_flight.len(), "draining");
        while let Some(joined) = in_flight.join_next().await {
            log_joined(joined);
        }
    }

    /// One message at a time, in delivery order.
    async fn run_sequential(&self, shutdown: watch::Receiver<bool>) {
        let mut last_claim = Instant::now();
        while !*shutdown.borrow() {
            for entry in self
                .fetch(self.options.chunk_length.max(1), &mut last_claim)
                .await
            {
                if self.route_to_dlq(&entry).await {
                    continue;
                }
                dispatch_one(self.handler.clone(), entry).await;
            }
        }
        self.set_state(StageState::Draining);
    }

    /// Fetch the next batch: the periodic claim pass first, then a blocking
    /// group read. Fetch failures are logged and retried after a backoff;
    /// the loop itself never dies to a transient store error.
    async fn fetch(&self, count: usize, last_claim: &mut Instant) -> Vec<StreamEntry> {
        if self.options.claim_idle > Duration::ZERO
            && last_claim.elapsed() >= self.options.claim_idle
        {
            *last_claim = Instant::now();
            for stream in self.handler.input_streams() {
                match self
                    .store
                    .claim_abandoned(
                        stream,
                        self.handler.group(),
                        &self.consumer,
                        self.options.claim_idle,
                        count,
                    )
                    .await
                {
                    Ok(claimed) if !claimed.is_empty() => {
                        info!(
                            group = self.handler.group(),
                            stream = %stream,
                            claimed = claimed.len(),
                            "claimed abandoned entries"
                        );
                        return claimed;
                    }
                    Ok(_) => {}
                    Err(error) => {
                        debug!(group = self.handler.group(), %error, "claim pass failed");
                    }
                }
            }
        }

        match self
            .store
            .read_group(
                self.handler.input_streams(),
                self.handler.group(),
                &self.consumer,
                count,
                self.options.block,
            )
            .await
        {
            Ok(entries) => entries,
            Err(error) => {
                warn!(
                    group = self.handler.group(),
                    consumer = %self.consumer,
                    %error,
                    "fetch failed; backing off"
                );
                // A missing group usually means the store was flushed under
                // us; re-registering restores progress.
                if let Err(error) = self.register().await {
                    debug!(group = self.handler.group(), %error, "re-registration failed");
                }
                tokio::time::sleep(FETCH_RETRY_BACKOFF).await;
                Vec::new()
            }
        }
    }

    /// Route an entry past `max_deliveries` to the stage's dead-letter
    /// stream, acknowledging it in the same batch. Returns `true` when the
    /// entry was consumed here.
    async fn route_to_dlq(&self, entry: &StreamEntry) -> bool {
        let Some(max) = self.options.max_deliveries else {
            return false;
        };
        if entry.deliveries <= max {
            return false;
        }

        let mut dead = Payload::new();
        dead.insert("original_entry", entry.id.to_string());
        dead.insert("deliveries", entry.deliveries.to_string());
        dead.insert("failed_at", chrono::Utc::now().to_rfc3339());
        match serde_json::to_string(&entry.payload) {
            Ok(payload) => dead.insert("payload", payload),
            Err(error) => {
                warn!(group = self.handler.group(), %error, "dead-letter payload unserializable");
            }
        }

        let dlq_stream = self.keyspace.dlq_stream(self.handler.group());
        match self
            .store
            .append_and_ack(
                &[(dlq_stream.clone(), dead)],
                &entry.ack_token(self.handler.group()),
            )
            .await
        {
            Ok(()) => {
                warn!(
                    group = self.handler.group(),
                    entry = %entry.id,
                    deliveries = entry.deliveries,
                    stream = %dlq_stream,
                    "entry exceeded max deliveries; dead-lettered"
                );
                true
            }
            Err(error) => {
                warn!(group = self.handler.group(), entry = %entry.id, %error, "dead-lettering failed");
                false
            }
        }
    }
}

async fn dispatch_one(handler: Arc<dyn StageHandler>, entry: StreamEntry) {
    let stream = entry.stream.clone();
    let id = entry.id;
    if let Err(error) = handler.handle(entry).await {
        if error.is_transient() {
            debug!(stream = %stream, entry = %id, %error, "handler failed; will redeliver");
        } else {
            warn!(stream = %stream, entry = %id, %error, "handler failed; message left pending");
        }
    }
}

fn log_joined(joined: Result<(), tokio::task::JoinError>) {
    if let Err(error) = joined {
        if error.is_cancelled() {
            debug!("in-flight handler cancelled");
        } else {
            warn!(%error, "in-flight handler panicked");
        }
    }
}
