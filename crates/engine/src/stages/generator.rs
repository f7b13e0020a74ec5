//! FieldGenerator: user code over a materialized dependency record.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task;
use tracing::debug;

use streamforge_core::{KeySpace, MessageId, Payload, decode_value, encode_value};
use streamforge_model::{
    DepRecord, GeneratorContext, GeneratorError, GeneratorFn, GeneratorSpec,
};
use streamforge_streams::{StreamEntry, StreamStore};

use crate::error::{EngineError, EngineResult};
use crate::stages::{DispatchMode, StageHandler};

/// Invokes the declared generator against each joined dependency record and
/// publishes the derived value as a single-field message.
///
/// Blocking generators run on the runtime's blocking pool, capped by a
/// semaphore so a slow generator cannot starve the rest of the process.
pub struct GeneratorStage {
    group: String,
    field_name: String,
    input_streams: Vec<String>,
    output_stream: String,
    generator: GeneratorFn,
    deps: Vec<streamforge_model::GeneratorDep>,
    store_params: Vec<String>,
    keyspace: KeySpace,
    store: Arc<dyn StreamStore>,
    blocking_pool: Arc<Semaphore>,
}

impl GeneratorStage {
    pub fn new(
        spec: GeneratorSpec,
        store: Arc<dyn StreamStore>,
        keyspace: KeySpace,
        blocking_pool_size: usize,
    ) -> Self {
        Self {
            group: spec.group,
            field_name: spec.field_name,
            input_streams: vec![spec.input_stream],
            output_stream: spec.output_stream,
            generator: spec.generator,
            deps: spec.deps,
            store_params: spec.store_params,
            keyspace,
            store,
            blocking_pool: Arc::new(Semaphore::new(blocking_pool_size.max(1))),
        }
    }

    /// Decode and validate the joined record against the declared types.
    fn materialize(&self, entry: &StreamEntry) -> EngineResult<(MessageId, DepRecord)> {
        let mut decoded: BTreeMap<String, Value> = entry
            .payload
            .iter()
            .map(|(field, raw)| (field.to_owned(), decode_value(raw)))
            .collect();

        let message_id = match decoded.remove(self.keyspace.msg_id_field()) {
            Some(Value::String(s)) => s.parse()?,
            Some(other) => {
                return Err(EngineError::validation(
                    format!("message id is not a string: {other}"),
                    &entry.payload,
                ));
            }
            None => {
                return Err(EngineError::validation(
                    "message lacks the reserved id field",
                    &entry.payload,
                ));
            }
        };

        let mut values = BTreeMap::new();
        for dep in &self.deps {
            let value = decoded.remove(&dep.param).ok_or_else(|| {
                EngineError::validation(
                    format!("joined record lacks dependency {:?}", dep.param),
                    &entry.payload,
                )
            })?;
            let matches = match dep.history_length {
                Some(_) => dep.field_type.matches_history(&value),
                None => dep.field_type.matches(&value),
            };
            if !matches {
                return Err(EngineError::validation(
                    format!(
                        "dependency {:?} does not match its declared {:?}",
                        dep.param, dep.field_type
                    ),
                    &entry.payload,
                ));
            }
            values.insert(dep.param.clone(), value);
        }
        Ok((message_id, DepRecord::new(values)))
    }
}

#[async_trait]
impl StageHandler for GeneratorStage {
    fn group(&self) -> &str {
        &self.group
    }

    fn input_streams(&self) -> &[String] {
        &self.input_streams
    }

    fn dispatch(&self) -> DispatchMode {
        if self.generator.is_blocking() {
            DispatchMode::Blocking
        } else {
            DispatchMode::Cooperative
        }
    }

    async fn handle(&self, entry: StreamEntry) -> EngineResult<()> {
        let (message_id, deps) = self.materialize(&entry)?;
        let context = GeneratorContext {
            message_id: message_id.clone(),
            deps,
            store: if self.store_params.is_empty() {
                None
            } else {
                Some(self.store.clone())
            },
        };

        let value = match &self.generator {
            GeneratorFn::Cooperative(f) => f(context).await?,
            GeneratorFn::Blocking(f) => {
                let f = f.clone();
                let _permit = self
                    .blocking_pool
                    .acquire()
                    .await
                    .map_err(|_| GeneratorError::failed("blocking pool closed"))?;
                task::spawn_blocking(move || f(context))
                    .await
                    .map_err(|e| GeneratorError::failed(format!("generator panicked: {e}")))??
            }
        };

        let mut output = Payload::new();
        output.insert(
            self.keyspace.msg_id_field(),
            encode_value(&Value::String(message_id.to_string())),
        );
        output.insert(self.field_name.clone(), encode_value(&value));

        debug!(
            group = %self.group,
            message_id = %message_id,
            field = %self.field_name,
            "generated derived value"
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
