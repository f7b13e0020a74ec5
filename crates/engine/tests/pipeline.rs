//! End-to-end pipeline scenarios over the in-memory store, with real worker
//! tasks driving each stage.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinSet;

use streamforge_core::{Config, KeySpace, MessageId, Payload, ReadStart};
use streamforge_engine::{StageHandler, StageWorker, Supervisor, WorkerOptions, build_stage};
use streamforge_model::{
    ArtificialFieldSpec, DepSpec, DependencySpec, FieldSource, FieldType, GeneratorContext,
    GeneratorDep, GeneratorFn, GeneratorSpec, InputSpec, ModelSpec, ResolverSpec, SplitterSpec,
    compile,
};
use streamforge_streams::{InMemoryStore, StreamStore};

fn test_options(config: &Config) -> WorkerOptions {
    let mut options = WorkerOptions::from_config(config);
    options.block = Duration::from_millis(20);
    options.read_start = ReadStart::Beginning;
    options.claim_idle = Duration::ZERO;
    options
}

fn payload(pairs: &[(&str, String)]) -> Payload {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

struct Pipeline {
    store: Arc<InMemoryStore>,
    shutdown_tx: watch::Sender<bool>,
    tasks: JoinSet<streamforge_engine::EngineResult<()>>,
}

impl Pipeline {
    fn new(store: Arc<InMemoryStore>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            store,
            shutdown_tx,
            tasks: JoinSet::new(),
        }
    }

    /// Spawn `workers` worker tasks for one stage.
    fn spawn(&mut self, handler: Arc<dyn StageHandler>, workers: usize, config: &Config) {
        for _ in 0..workers {
            let worker = StageWorker::new(
                handler.clone(),
                self.store.clone(),
                KeySpace::new(config),
                test_options(config),
            );
            let shutdown_rx = self.shutdown_tx.subscribe();
            self.tasks.spawn(worker.run(shutdown_rx));
        }
    }

    /// Wait for `stream` to reach `expected` entries, then drain all workers.
    async fn drain_at(mut self, stream: &str, expected: u64) -> Arc<InMemoryStore> {
        for _ in 0..500 {
            if self.store.stream_len(stream).await.unwrap() >= expected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // Give stragglers a moment: at-least-once means extra work may still
        // be in flight even after the expected count is reached.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = self.shutdown_tx.send(true);
        while let Some(joined) = self.tasks.join_next().await {
            joined.unwrap().unwrap();
        }
        self.store
    }
}

fn splitter_spec() -> SplitterSpec {
    SplitterSpec {
        group: "test.split".into(),
        input_stream: "test_input".into(),
        output_stream: ":test:split".into(),
        object_id_field: "vehicle_id".into(),
        workers: 1,
    }
}

async fn write_test_reports(store: &Arc<InMemoryStore>, num: usize) {
    for i in 0..num {
        store
            .append(
                "test_input",
                payload(&[
                    ("vehicle_id", "V1".to_string()),
                    ("a", i.to_string()),
                    ("b", (i + 1).to_string()),
                ]),
            )
            .await
            .unwrap();
    }
}

/// One splitter worker, one entity, ten inputs.
#[tokio::test]
async fn splitter_sequences_a_single_entity() {
    let config = Config::default();
    let store = Arc::new(InMemoryStore::new());
    write_test_reports(&store, 10).await;

    let mut pipeline = Pipeline::new(store.clone());
    pipeline.spawn(
        build_stage(
            streamforge_model::StageSpec::Splitter(splitter_spec()),
            store.clone(),
            &config,
        ),
        1,
        &config,
    );
    let store = pipeline.drain_at(":test:split", 10).await;

    let split = store.read_after(":test:split", None, 100).await.unwrap();
    assert_eq!(split.len(), 10);
    let first = &split[0].payload;
    assert_eq!(first.get(":_msg_id"), Some("\"V1:1\""));
    assert_eq!(first.get("a"), Some("0"));
    assert_eq!(first.get("b"), Some("1"));
    assert_eq!(first.get("vehicle_id"), Some("V1"));
}

/// Sixteen concurrent splitter workers still produce a dense 1..10.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn splitter_stays_dense_under_concurrency() {
    let config = Config::default();
    let store = Arc::new(InMemoryStore::new());
    write_test_reports(&store, 10).await;

    let mut pipeline = Pipeline::new(store.clone());
    pipeline.spawn(
        build_stage(
            streamforge_model::StageSpec::Splitter(splitter_spec()),
            store.clone(),
            &config,
        ),
        16,
        &config,
    );
    let store = pipeline.drain_at(":test:split", 10).await;

    let split = store.read_after(":test:split", None, 100).await.unwrap();
    assert_eq!(split.len(), 10);
    let sequences: BTreeSet<u64> = split
        .iter()
        .map(|entry| {
            let raw = entry.payload.get(":_msg_id").unwrap();
            let id: MessageId = serde_json::from_str::<String>(raw)
                .unwrap()
                .parse()
                .unwrap();
            assert_eq!(id.object_id(), "V1");
            id.sequence()
        })
        .collect();
    assert_eq!(sequences, (1..=10).collect::<BTreeSet<u64>>());
}

fn ab_resolver(output_stream: &str) -> ResolverSpec {
    ResolverSpec {
        group: "ab_resolver.deps".into(),
        dependencies: vec![
            DependencySpec {
                src_stream: ":a".into(),
                src_key: "a".into(),
                dst_key: "a".into(),
                history_length: None,
            },
            DependencySpec {
                src_stream: ":b".into(),
                src_key: "b".into(),
                dst_key: "b".into(),
                history_length: None,
            },
        ],
        output_stream: output_stream.into(),
        workers: 1,
    }
}

async fn write_ab_contributors(store: &Arc<InMemoryStore>, num: usize) {
    for i in 0..num {
        let msg_id = format!("\"V1:{i}\"");
        store
            .append(
                ":a",
                payload(&[(":_msg_id", msg_id.clone()), ("a", i.to_string())]),
            )
            .await
            .unwrap();
        store
            .append(
                ":b",
                payload(&[(":_msg_id", msg_id), ("b", i.to_string())]),
            )
            .await
            .unwrap();
    }
}

/// A two-contributor join over one hundred message ids.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn resolver_joins_contributor_pairs() {
    let config = Config::default();
    let store = Arc::new(InMemoryStore::new());
    write_ab_contributors(&store, 100).await;

    let mut pipeline = Pipeline::new(store.clone());
    pipeline.spawn(
        build_stage(
            streamforge_model::StageSpec::Resolver(ab_resolver(":ab_resolver:deps")),
            store.clone(),
            &config,
        ),
        4,
        &config,
    );
    let store = pipeline.drain_at(":ab_resolver:deps", 100).await;

    let out = store
        .read_after(":ab_resolver:deps", None, 1000)
        .await
        .unwrap();
    assert_eq!(out.len(), 100);
    let mut seen = BTreeSet::new();
    for entry in &out {
        let msg_id: String =
            serde_json::from_str(entry.payload.get(":_msg_id").unwrap()).unwrap();
        let seq = msg_id.rsplit(':').next().unwrap();
        assert_eq!(seq, entry.payload.get("a").unwrap());
        assert_eq!(seq, entry.payload.get("b").unwrap());
        assert!(seen.insert(msg_id), "duplicate emission");
    }
}

/// A duplicated contributor is absorbed; emission happens exactly once.
#[tokio::test]
async fn resolver_absorbs_duplicate_contributors() {
    let config = Config::default();
    let store = Arc::new(InMemoryStore::new());
    let msg_id = "\"V1:0\"".to_string();
    store
        .append(":a", payload(&[(":_msg_id", msg_id.clone()), ("a", "7".into())]))
        .await
        .unwrap();
    store
        .append(":a", payload(&[(":_msg_id", msg_id.clone()), ("a", "7".into())]))
        .await
        .unwrap();
    store
        .append(":b", payload(&[(":_msg_id", msg_id), ("b", "9".into())]))
        .await
        .unwrap();

    let mut pipeline = Pipeline::new(store.clone());
    pipeline.spawn(
        build_stage(
            streamforge_model::StageSpec::Resolver(ab_resolver(":ab_resolver:deps")),
            store.clone(),
            &config,
        ),
        2,
        &config,
    );
    let store = pipeline.drain_at(":ab_resolver:deps", 1).await;
    assert_eq!(store.stream_len(":ab_resolver:deps").await.unwrap(), 1);
}

/// A generator fed by the two-contributor join emits `sum = a + b`
/// per message.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn generator_derives_over_joined_records() {
    let config = Config::default();
    let store = Arc::new(InMemoryStore::new());
    write_ab_contributors(&store, 100).await;

    let generator = GeneratorSpec {
        group: "sum.generate".into(),
        field_name: "sum".into(),
        input_stream: ":sum:deps".into(),
        output_stream: ":artificial:sum".into(),
        generator: GeneratorFn::cooperative(|ctx: GeneratorContext| async move {
            Ok(json!(ctx.deps.i64("a")? + ctx.deps.i64("b")?))
        }),
        return_type: FieldType::Integer,
        deps: vec![
            GeneratorDep {
                param: "a".into(),
                field_type: FieldType::Integer,
                history_length: None,
            },
            GeneratorDep {
                param: "b".into(),
                field_type: FieldType::Integer,
                history_length: None,
            },
        ],
        store_params: vec![],
        workers: 1,
    };

    let mut pipeline = Pipeline::new(store.clone());
    pipeline.spawn(
        build_stage(
            streamforge_model::StageSpec::Resolver(ab_resolver(":sum:deps")),
            store.clone(),
            &config,
        ),
        4,
        &config,
    );
    pipeline.spawn(
        build_stage(
            streamforge_model::StageSpec::Generator(generator),
            store.clone(),
            &config,
        ),
        4,
        &config,
    );
    let store = pipeline.drain_at(":artificial:sum", 100).await;

    let out = store
        .read_after(":artificial:sum", None, 1000)
        .await
        .unwrap();
    assert_eq!(out.len(), 100);
    for entry in &out {
        let msg_id: String =
            serde_json::from_str(entry.payload.get(":_msg_id").unwrap()).unwrap();
        let i: i64 = msg_id.rsplit(':').next().unwrap().parse().unwrap();
        let sum: i64 = entry.payload.get("sum").unwrap().parse().unwrap();
        assert_eq!(sum, 2 * i);
    }
}

/// A self-referential historical counter over the full compiled
/// pipeline: each value is the previous one plus one, starting from zero.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn historical_counter_counts_per_entity() {
    let config = Config::default();
    let model = ModelSpec::new()
        .with_input(
            InputSpec::new("ztm", "vehicle_number")
                .with_field("vehicle_number", FieldType::Integer)
                .with_field("time", FieldType::Text),
        )
        .with_artificial_field(
            ArtificialFieldSpec::new(
                "counter",
                GeneratorFn::cooperative(|ctx: GeneratorContext| async move {
                    let prev = ctx.deps.history("prev_values")?[0].as_i64().unwrap_or(-1);
                    Ok(json!(prev + 1))
                }),
                FieldType::Integer,
            )
            .with_dep(DepSpec::historical(
                "prev_values",
                FieldSource::artificial("counter"),
                1,
            ))
            .with_dep(DepSpec::current("time", FieldSource::input("ztm", "time"))),
        );
    let topology = compile(model, &config).unwrap();

    let store = Arc::new(InMemoryStore::new());
    let supervisor = Supervisor::new(config.clone(), store.clone(), topology)
        .with_options(test_options(&config));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run = tokio::spawn(async move { supervisor.run_with_shutdown(shutdown_rx).await });

    // Telemetry cadence: each report lands only after the previous
    // derivation has flowed back into the next message's accumulator. This
    // is what makes the historical feed observable in order.
    let keyspace = KeySpace::new(&config);
    for i in 0..5u64 {
        store
            .append(
                ":ztm",
                payload(&[
                    ("vehicle_number", "1000".to_string()),
                    ("time", format!("\"t{i}\"")),
                ]),
            )
            .await
            .unwrap();
        let future_map = keyspace.dependency_map_key(
            ":counter:deps",
            &MessageId::new("1000", i + 2),
        );
        for _ in 0..500 {
            let derived = store.stream_len(":artificial:counter").await.unwrap() >= i + 1;
            let pre_written = store
                .read_map(&future_map)
                .await
                .unwrap()
                .contains_key("prev_values:0");
            if derived && pre_written {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    shutdown_tx.send(true).unwrap();
    run.await.unwrap().unwrap();

    let out = store
        .read_after(":artificial:counter", None, 100)
        .await
        .unwrap();
    assert_eq!(out.len(), 5);
    let values: Vec<i64> = out
        .iter()
        .map(|entry| entry.payload.get("counter").unwrap().parse().unwrap())
        .collect();
    assert_eq!(values, vec![0, 1, 2, 3, 4]);
}
