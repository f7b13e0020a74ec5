//! Redis Streams-backed log store (durable, at-least-once delivery).
//!
//! Streams carry the pipeline traffic (XADD/XREADGROUP/XACK with consumer
//! groups); hashes and counters carry resolver accumulators. The three
//! compound operations the pipeline's correctness depends on are atomic
//! here as follows:
//!
//! - `next_sequence`: a single INCR;
//! - `stage_contributors`: one Lua script (HSETNX + INCRBY + historical
//!   HSETs execute as one step, and the returned counter is the emission
//!   decision);
//! - `append_and_ack` / `emit_joined`: MULTI/EXEC pipelines.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{
    StreamClaimReply, StreamId, StreamPendingCountReply, StreamRangeReply,
    StreamReadOptions, StreamReadReply,
};
use redis::{AsyncCommands, RedisError, Script};
use tracing::debug;

use streamforge_core::{Payload, ReadStart};

use crate::entry::{AckToken, EntryId, StreamEntry};
use crate::error::{StoreError, StoreResult};
use crate::store::{ContributorBatch, StreamStore};

/// Redis-backed [`StreamStore`].
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    stage_script: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to the store at `redis_uri`.
    pub async fn connect(redis_uri: &str) -> StoreResult<Self> {
        let client = redis::Client::open(redis_uri)
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(Self {
            conn,
            stage_script: Script::new(include_str!("stage_contributors.lua")),
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

fn command_error(e: RedisError) -> StoreError {
    if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() {
        StoreError::Connection(e.to_string())
    } else {
        StoreError::Command(e.to_string())
    }
}

fn payload_pairs(payload: &Payload) -> Vec<(String, String)> {
    payload
        .iter()
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .collect()
}

fn entry_from_stream_id(stream: &str, id: &StreamId, deliveries: u64) -> StoreResult<StreamEntry> {
    let mut payload = Payload::new();
    for (field, value) in &id.map {
        let value: String = redis::from_redis_value(value)
            .map_err(|e| StoreError::MalformedReply(format!("field {field:?}: {e}")))?;
        payload.insert(field.clone(), value);
    }
    Ok(StreamEntry {
        stream: stream.to_owned(),
        id: id.id.parse()?,
        payload,
        deliveries,
    })
}

#[async_trait]
impl StreamStore for RedisStore {
    async fn ensure_group(
        &self,
        stream: &str,
        group: &str,
        start: ReadStart,
    ) -> StoreResult<()> {
        let mut conn = self.conn();
        let created: Result<String, RedisError> = conn
            .xgroup_create_mkstream(stream, group, start.cursor())
            .await;
        match created {
            Ok(_) => Ok(()),
            // The group surviving a previous run is the normal case.
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(StoreError::ConsumerGroup(format!(
                "XGROUP CREATE {stream} {group}: {e}"
            ))),
        }
    }

    async fn append(&self, stream: &str, payload: Payload) -> StoreResult<EntryId> {
        let mut conn = self.conn();
        let id: String = conn
            .xadd(stream, "*", &payload_pairs(&payload))
            .await
            .map_err(command_error)?;
        id.parse()
    }

    async fn read_group(
        &self,
        streams: &[String],
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> StoreResult<Vec<StreamEntry>> {
        let mut conn = self.conn();
        let options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block.as_millis() as usize);
        let cursors = vec![">"; streams.len()];
        let reply: Option<StreamReadReply> = conn
            .xread_options(streams, &cursors, &options)
            .await
            .map_err(command_error)?;

        let Some(reply) = reply else {
            // BLOCK timed out with nothing new; not an error.
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for key in &reply.keys {
            for id in &key.ids {
                out.push(entry_from_stream_id(&key.key, id, 1)?);
            }
        }
        Ok(out)
    }

    async fn ack(&self, token: &AckToken) -> StoreResult<()> {
        let mut conn = self.conn();
        let _: u64 = conn
            .xack(&token.stream, &token.group, &[token.id.to_string()])
            .await
            .map_err(command_error)?;
        Ok(())
    }

    async fn append_and_ack(
        &self,
        outputs: &[(String, Payload)],
        ack: &AckToken,
    ) -> StoreResult<()> {
        let mut conn = self.conn();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (stream, payload) in outputs {
            pipe.cmd("XADD").arg(stream).arg("*");
            for (field, value) in payload.iter() {
                pipe.arg(field).arg(value);
            }
            pipe.ignore();
        }
        pipe.cmd("XACK")
            .arg(&ack.stream)
            .arg(&ack.group)
            .arg(ack.id.to_string())
            .ignore();
        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(command_error)
    }

    async fn next_sequence(&self, key: &str) -> StoreResult<u64> {
        let mut conn = self.conn();
        conn.incr(key, 1u64).await.map_err(command_error)
    }

    async fn stage_contributors(&self, batch: &ContributorBatch) -> StoreResult<u64> {
        let mut conn = self.conn();
        let mut invocation = self.stage_script.prepare_invoke();
        invocation.key(&batch.map_key).key(&batch.counter_key);
        for (map_key, _, _) in &batch.history_writes {
            invocation.key(map_key);
        }
        invocation.arg(batch.contributors.len());
        for (field, value) in &batch.contributors {
            invocation.arg(field).arg(value);
        }
        for (_, field, value) in &batch.history_writes {
            invocation.arg(field).arg(value);
        }
        let total: u64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(command_error)?;
        debug!(
            map_key = %batch.map_key,
            contributors = batch.contributors.len(),
            counter = total,
            "staged contributors"
        );
        Ok(total)
    }

    async fn read_map(&self, map_key: &str) -> StoreResult<BTreeMap<String, String>> {
        let mut conn = self.conn();
        conn.hgetall(map_key).await.map_err(command_error)
    }

    async fn emit_joined(
        &self,
        map_key: &str,
        counter_key: &str,
        output_stream: &str,
        payload: Payload,
        ack: &AckToken,
    ) -> StoreResult<()> {
        let mut conn = self.conn();
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("DEL").arg(map_key).arg(counter_key).ignore();
        pipe.cmd("XADD").arg(output_stream).arg("*");
        for (field, value) in payload.iter() {
            pipe.arg(field).arg(value);
        }
        pipe.ignore();
        pipe.cmd("XACK")
            .arg(&ack.stream)
            .arg(&ack.group)
            .arg(ack.id.to_string())
            .ignore();
        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(command_error)
    }

    async fn claim_abandoned(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> StoreResult<Vec<StreamEntry>> {
        let mut conn = self.conn();
        let pending: StreamPendingCountReply = conn
            .xpending_count(stream, group, "-", "+", count)
            .await
            .map_err(command_error)?;

        let min_idle_ms = min_idle.as_millis() as u64;
        let stale: Vec<String> = pending
            .ids
            .iter()
            .filter(|p| p.last_delivered_ms as u64 >= min_idle_ms)
            .map(|p| p.id.clone())
            .collect();
        if stale.is_empty() {
            return Ok(Vec::new());
        }
        let deliveries: BTreeMap<String, u64> = pending
            .ids
            .iter()
            .map(|p| (p.id.clone(), p.times_delivered as u64))
            .collect();

        // XCLAIM only returns entries that were still idle long enough at
        // claim time, so a concurrent rescuer cannot double-claim.
        let claimed: StreamClaimReply = conn
            .xclaim(stream, group, consumer, min_idle_ms as usize, &stale)
            .await
            .map_err(command_error)?;

        let mut out = Vec::with_capacity(claimed.ids.len());
        for id in &claimed.ids {
            let previous = deliveries.get(&id.id).copied().unwrap_or(1);
            out.push(entry_from_stream_id(stream, id, previous + 1)?);
        }
        Ok(out)
    }

    async fn try_lock(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.conn();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg("1")
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(command_error)?;
        Ok(reply.is_some())
    }

    async fn unlock(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.conn();
        let _: u64 = conn.del(key).await.map_err(command_error)?;
        Ok(())
    }

    async fn stream_len(&self, stream: &str) -> StoreResult<u64> {
        let mut conn = self.conn();
        conn.xlen(stream).await.map_err(command_error)
    }

    async fn read_after(
        &self,
        stream: &str,
        after: Option<EntryId>,
        count: usize,
    ) -> StoreResult<Vec<StreamEntry>> {
        let mut conn = self.conn();
        let start = match after {
            Some(id) => format!("({id}"),
            None => "-".to_owned(),
        };
        let reply: StreamRangeReply = conn
            .xrange_count(stream, start, "+", count)
            .await
            .map_err(command_error)?;
        reply
            .ids
            .iter()
            .map(|id| entry_from_stream_id(stream, id, 0))
            .collect()
    }
}
