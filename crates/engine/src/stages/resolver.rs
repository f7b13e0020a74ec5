//! DependencyResolver: join/barrier over a message's contributor set.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use streamforge_core::{KeySpace, MessageId, Payload, decode_value, encode_value};
use streamforge_model::{DependencySpec, ResolverSpec};
use streamforge_streams::{ContributorBatch, StreamEntry, StreamStore};

use crate::error::{EngineError, EngineResult};
use crate::stages::{DispatchMode, StageHandler};

/// Joins the declared contributors for one message id into a single record.
///
/// Every contributor write goes through one atomic stage-and-count step in
/// the store; the counter value coming back is the election: exactly the
/// worker that observes `counter == num_dependencies` emits. Historical
/// dependencies never count: their values are pre-written into the
/// accumulators of *future* messages at the moment the source value flows
/// by, which replaces an unbounded history scan with `history_length`
/// constant-time writes.
pub struct ResolverStage {
    group: String,
    input_streams: Vec<String>,
    output_stream: String,
    dependencies: Vec<DependencySpec>,
    num_dependencies: u64,
    keyspace: KeySpace,
    store: Arc<dyn StreamStore>,
}

impl ResolverStage {
    pub fn new(spec: ResolverSpec, store: Arc<dyn StreamStore>, keyspace: KeySpace) -> Self {
        let input_streams = spec.input_streams();
        let num_dependencies = spec.num_dependencies();
        Self {
            group: spec.group,
            input_streams,
            output_stream: spec.output_stream,
            dependencies: spec.dependencies,
            num_dependencies,
            keyspace,
            store,
        }
    }

    fn batch_for(&self, entry: &StreamEntry, message_id: &MessageId) -> ContributorBatch {
        let map_key = self
            .keyspace
            .dependency_map_key(&self.output_stream, message_id);
        let counter_key = self.keyspace.dependency_counter_key(&map_key);

        let mut batch = ContributorBatch {
            map_key,
            counter_key,
            contributors: Vec::new(),
            history_writes: Vec::new(),
        };
        for dep in &self.dependencies {
            if dep.src_stream != entry.stream {
                continue;
            }
            let Some(value) = entry.payload.get(&dep.src_key) else {
                continue;
            };
            match dep.history_length {
                None => {
                    batch
                        .contributors
                        .push((dep.dst_key.clone(), value.to_owned()));
                }
                Some(length) => {
                    // The value current at obj_seq lands at distance i in the
                    // accumulator of obj_seq + i, under position length - i.
                    for i in 1..=length {
                        let future_map = self
                            .keyspace
                            .dependency_map_key(&self.output_stream, &message_id.advance(i));
                        batch.history_writes.push((
                            future_map,
                            self.keyspace.history_field(&dep.dst_key, length - i),
                            value.to_owned(),
                        ));
                    }
                }
            }
        }
        batch
    }

    /// Assemble the joined record from a complete accumulator hash.
    fn joined_record(
        &self,
        message_id: &MessageId,
        map: &std::collections::BTreeMap<String, String>,
    ) -> Payload {
        let mut output = Payload::new();
        output.insert(
            self.keyspace.msg_id_field(),
            encode_value(&Value::String(message_id.to_string())),
        );
        for dep in &self.dependencies {
            match dep.history_length {
                None => {
                    if let Some(value) = map.get(&dep.dst_key) {
                        output.insert(dep.dst_key.clone(), value.clone());
                    }
                }
                Some(length) => {
                    let items: Vec<Value> = (0..length)
                        .map(|position| {
                            map.get(&self.keyspace.history_field(&dep.dst_key, position))
                                .map(|raw| decode_value(raw))
                                .unwrap_or(Value::Null)
                        })
                        .collect();
                    output.insert(dep.dst_key.clone(), encode_value(&Value::Array(items)));
                }
            }
        }
        output
    }
}

#[async_trait]
impl StageHandler for ResolverStage {
    fn group(&self) -> &str {
        &self.group
    }

    fn input_streams(&self) -> &[String] {
        &self.input_streams
    }

    fn dispatch(&self) -> DispatchMode {
        DispatchMode::Cooperative
    }

    async fn handle(&self, entry: StreamEntry) -> EngineResult<()> {
        let raw_id = entry
            .payload
            .get(self.keyspace.msg_id_field())
            .ok_or_else(|| {
                EngineError::validation("message lacks the reserved id field", &entry.payload)
            })?;
        let message_id: MessageId = match decode_value(raw_id) {
            Value::String(s) => s.parse()?,
            other => {
                return Err(EngineError::validation(
                    format!("message id is not a string: {other}"),
                    &entry.payload,
                ));
            }
        };

        let batch = self.batch_for(&entry, &message_id);
        let counter = self.store.stage_contributors(&batch).await?;
        debug!(
            group = %self.group,
            message_id = %message_id,
            counter,
            target = self.num_dependencies,
            "staged contributors"
        );

        // A resolver with nothing to wait for filters without emitting.
        if self.num_dependencies > 0 && counter == self.num_dependencies {
            let map = self.store.read_map(&batch.map_key).await?;
            let output = self.joined_record(&message_id, &map);
            self.store
                .emit_joined(
                    &batch.map_key,
                    &batch.counter_key,
                    &self.output_stream,
                    output,
                    &entry.ack_token(&self.group),
                )
                .await?;
        } else {
            self.store.ack(&entry.ack_token(&self.group)).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use streamforge_core::{Config, ReadStart};
    use streamforge_streams::InMemoryStore;

    use super::*;

    fn dep(src_stream: &str, src_key: &str, dst_key: &str) -> DependencySpec {
        DependencySpec {
            src_stream: src_stream.into(),
            src_key: src_key.into(),
            dst_key: dst_key.into(),
            history_length: None,
        }
    }

    fn resolver(store: Arc<InMemoryStore>, deps: Vec<DependencySpec>) -> ResolverStage {
        ResolverStage::new(
            ResolverSpec {
                group: "ab.deps".into(),
                dependencies: deps,
                output_stream: ":ab:deps".into(),
                workers: 1,
            },
            store,
            KeySpace::new(&Config::default()),
        )
    }

    async fn feed(
        store: &Arc<InMemoryStore>,
        stage: &ResolverStage,
        stream: &str,
        fields: &[(&str, &str)],
    ) {
        let mut payload = Payload::new();
        for (k, v) in fields {
            payload.insert(k.to_string(), v.to_string());
        }
        store.append(stream, payload).await.unwrap();
        let entry = store
            .read_group(
                &[stream.to_owned()],
                "ab.deps",
                "w",
                1,
                Duration::from_millis(10),
            )
            .await
            .unwrap()
            .remove(0);
        stage.handle(entry).await.unwrap();
    }

    async fn setup(store: &Arc<InMemoryStore>, streams: &[&str]) {
        for stream in streams {
            store
                .ensure_group(stream, "ab.deps", ReadStart::Beginning)
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn emits_once_both_contributors_arrive() {
        let store = Arc::new(InMemoryStore::new());
        let stage = resolver(
            store.clone(),
            vec![dep(":a", "a", "a"), dep(":b", "b", "b")],
        );
        setup(&store, &[":a", ":b"]).await;

        feed(&store, &stage, ":a", &[(":_msg_id", "\"V1:1\""), ("a", "7")]).await;
        assert_eq!(store.stream_len(":ab:deps").await.unwrap(), 0);

        feed(&store, &stage, ":b", &[(":_msg_id", "\"V1:1\""), ("b", "8")]).await;
        let out = store.read_after(":ab:deps", None, 10).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].payload.get(":_msg_id"), Some("\"V1:1\""));
        assert_eq!(out[0].payload.get("a"), Some("7"));
        assert_eq!(out[0].payload.get("b"), Some("8"));
        // Accumulator state is gone with the emission.
        assert!(store
            .read_map(":depmap:ab:deps:V1:1")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn duplicate_contributor_cannot_double_emit() {
        let store = Arc::new(InMemoryStore::new());
        let stage = resolver(
            store.clone(),
            vec![dep(":a", "a", "a"), dep(":b", "b", "b")],
        );
        setup(&store, &[":a", ":b"]).await;

        feed(&store, &stage, ":a", &[(":_msg_id", "\"V1:1\""), ("a", "7")]).await;
        feed(&store, &stage, ":a", &[(":_msg_id", "\"V1:1\""), ("a", "7")]).await;
        assert_eq!(store.stream_len(":ab:deps").await.unwrap(), 0);

        feed(&store, &stage, ":b", &[(":_msg_id", "\"V1:1\""), ("b", "8")]).await;
        assert_eq!(store.stream_len(":ab:deps").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn historical_values_reach_future_messages() {
        let store = Arc::new(InMemoryStore::new());
        let stage = resolver(
            store.clone(),
            vec![
                dep(":a", "a", "a"),
                DependencySpec {
                    src_stream: ":a".into(),
                    src_key: "a".into(),
                    dst_key: "prev".into(),
                    history_length: Some(2),
                },
            ],
        );
        setup(&store, &[":a"]).await;

        for (seq, value) in [(1, "10"), (2, "20"), (3, "30")] {
            let msg_id = format!("\"V1:{seq}\"");
            feed(&store, &stage, ":a", &[(":_msg_id", &msg_id), ("a", value)]).await;
        }

        let out = store.read_after(":ab:deps", None, 10).await.unwrap();
        assert_eq!(out.len(), 3);
        // First message: no history yet.
        assert_eq!(out[0].payload.get("prev"), Some("[null,null]"));
        // Second: one value, in the most recent slot.
        assert_eq!(out[1].payload.get("prev"), Some("[null,10]"));
        // Third: both, oldest first.
        assert_eq!(out[2].payload.get("prev"), Some("[10,20]"));
    }

    #[tokio::test]
    async fn resolver_without_dependencies_filters_silently() {
        let store = Arc::new(InMemoryStore::new());
        let stage = resolver(store.clone(), vec![]);
        store
            .ensure_group(":a", "ab.deps", ReadStart::Beginning)
            .await
            .unwrap();

        let mut payload = Payload::new();
        payload.insert(":_msg_id", "\"V1:1\"");
        store.append(":a", payload).await.unwrap();
        let entry = store
            .read_group(
                &[":a".to_owned()],
                "ab.deps",
                "w",
                1,
                Duration::from_millis(10),
            )
            .await
            .unwrap()
            .remove(0);
        stage.handle(entry).await.unwrap();

        assert_eq!(store.stream_len(":ab:deps").await.unwrap(), 0);
        // Acked regardless.
        let pending = store
            .claim_abandoned(":a", "ab.deps", "w2", Duration::ZERO, 10)
            .await
            .unwrap();
        assert!(pending.is_empty());
    }
}
