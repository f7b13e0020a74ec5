//! Splitter: per-entity sequencing and normalization.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use streamforge_core::{KeySpace, MessageId, encode_value, decode_value};
use streamforge_model::SplitterSpec;
use streamforge_streams::{StreamEntry, StreamStore};

use crate::error::{EngineError, EngineResult};
use crate::stages::{DispatchMode, StageHandler};

/// Assigns a per-entity monotonic sequence to each raw input record and
/// re-publishes it with the reserved message-id field set.
///
/// The store's atomic increment is the sequencing point: any number of
/// splitter workers produce a dense per-entity sequence without talking to
/// each other. A crash after the increment but before the ack re-emits the
/// record under a fresh sequence; downstream keys off the message id.
pub struct SplitterStage {
    group: String,
    input_streams: Vec<String>,
    output_stream: String,
    object_id_field: String,
    keyspace: KeySpace,
    store: Arc<dyn StreamStore>,
}

impl SplitterStage {
    pub fn new(spec: SplitterSpec, store: Arc<dyn StreamStore>, keyspace: KeySpace) -> Self {
        Self {
            group: spec.group,
            input_streams: vec![spec.input_stream],
            output_stream: spec.output_stream,
            object_id_field: spec.object_id_field,
            keyspace,
            store,
        }
    }
}

#[async_trait]
impl StageHandler for SplitterStage {
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
        let raw_id = entry.payload.get(&self.object_id_field).ok_or_else(|| {
            EngineError::validation(
                format!("input lacks id field {:?}", self.object_id_field),
                &entry.payload,
            )
        })?;
        // Raw client input may carry the id unencoded; either way the
        // canonical object id is the decoded scalar's text form.
        let object_id = match decode_value(raw_id) {
            Value::String(s) => s,
            other => other.to_string(),
        };

        let sequence = self
            .store
            .next_sequence(&self.keyspace.sequence_key(&object_id))
            .await?;
        let message_id = MessageId::new(object_id, sequence);

        let mut output = entry.payload.clone();
        output.insert(
            self.keyspace.msg_id_field(),
            encode_value(&Value::String(message_id.to_string())),
        );

        debug!(
            stream = %entry.stream,
            entry = %entry.id,
            message_id = %message_id,
            "split input record"
        );
        self.store
            .append_and_ack(
                &[(self.output_stream.clone(), output)],
                &entry.ack_token(&self.group),
            )
            .await?;
        Ok(())
    }
}
