//! In-memory log store for tests and single-process development.
//!
//! Mirrors the consumer-group semantics of the production backend closely
//! enough to run the full pipeline: per-group cursors, pending entries with
//! delivery counts, blocking reads (realized by polling), and the same
//! atomic compound operations. No IO, no persistence.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

use streamforge_core::{Payload, ReadStart};

use crate::entry::{AckToken, EntryId, StreamEntry};
use crate::error::{StoreError, StoreResult};
use crate::store::{ContributorBatch, StreamStore};

/// How often a blocking read re-checks for new entries.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Debug, Default)]
struct GroupState {
    /// Index of the next entry this group has not yet delivered.
    cursor: usize,
    pending: HashMap<EntryId, PendingEntry>,
}

#[derive(Debug)]
struct PendingEntry {
    consumer: String,
    delivered_at: Instant,
    deliveries: u64,
    index: usize,
}

#[derive(Debug, Default)]
struct StreamState {
    entries: Vec<(EntryId, Payload)>,
    groups: HashMap<String, GroupState>,
}

#[derive(Debug, Default)]
struct Inner {
    streams: HashMap<String, StreamState>,
    hashes: HashMap<String, BTreeMap<String, String>>,
    counters: HashMap<String, u64>,
    /// Advisory locks: key → expiry.
    locks: HashMap<String, Instant>,
    last_millis: u64,
    last_seq: u64,
}

impl Inner {
    fn next_entry_id(&mut self) -> EntryId {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        if now <= self.last_millis {
            self.last_seq += 1;
        } else {
            self.last_millis = now;
            self.last_seq = 0;
        }
        EntryId::new(self.last_millis, self.last_seq)
    }

    fn append(&mut self, stream: &str, payload: Payload) -> EntryId {
        let id = self.next_entry_id();
        self.streams
            .entry(stream.to_owned())
            .or_default()
            .entries
            .push((id, payload));
        id
    }

    fn ack(&mut self, token: &AckToken) {
        if let Some(stream) = self.streams.get_mut(&token.stream) {
            if let Some(group) = stream.groups.get_mut(&token.group) {
                group.pending.remove(&token.id);
            }
        }
    }

    fn collect_new(
        &mut self,
        streams: &[String],
        group: &str,
        consumer: &str,
        count: usize,
    ) -> StoreResult<Vec<StreamEntry>> {
        let mut out = Vec::new();
        for name in streams {
            let StreamState { entries, groups } = self.streams.get_mut(name).ok_or_else(|| {
                StoreError::ConsumerGroup(format!("no group {group:?} on stream {name:?}"))
            })?;
            let state = groups.get_mut(group).ok_or_else(|| {
                StoreError::ConsumerGroup(format!("no group {group:?} on stream {name:?}"))
            })?;
            while state.cursor < entries.len() && out.len() < count {
                let index = state.cursor;
                let (id, payload) = entries[index].clone();
                state.cursor += 1;
                state.pending.insert(
                    id,
                    PendingEntry {
                        consumer: consumer.to_owned(),
                        delivered_at: Instant::now(),
                        deliveries: 1,
                        index,
                    },
                );
                out.push(StreamEntry {
                    stream: name.clone(),
                    id,
                    payload,
                    deliveries: 1,
                });
            }
            if out.len() >= count {
                break;
            }
        }
        Ok(out)
    }
}

/// In-memory [`StreamStore`] backend.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Command("store mutex poisoned".to_owned()))
    }
}

#[async_trait]
impl StreamStore for InMemoryStore {
    async fn ensure_group(
        &self,
        stream: &str,
        group: &str,
        start: ReadStart,
    ) -> StoreResult<()> {
        let mut inner = self.lock()?;
        let state = inner.streams.entry(stream.to_owned()).or_default();
        let cursor = match start {
            ReadStart::Beginning => 0,
            ReadStart::Latest => state.entries.len(),
        };
        state.groups.entry(group.to_owned()).or_insert(GroupState {
            cursor,
            pending: HashMap::new(),
        });
        Ok(())
    }

    async fn append(&self, stream: &str, payload: Payload) -> StoreResult<EntryId> {
        Ok(self.lock()?.append(stream, payload))
    }

    async fn read_group(
        &self,
        streams: &[String],
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> StoreResult<Vec<StreamEntry>> {
        let deadline = Instant::now() + block;
        loop {
            let got = self.lock()?.collect_new(streams, group, consumer, count)?;
            if !got.is_empty() {
                return Ok(got);
            }
            if Instant::now() >= deadline {
                return Ok(Vec::new());
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn ack(&self, token: &AckToken) -> StoreResult<()> {
        self.lock()?.ack(token);
        Ok(())
    }

    async fn append_and_ack(
        &self,
        outputs: &[(String, Payload)],
        ack: &AckToken,
    ) -> StoreResult<()> {
        let mut inner = self.lock()?;
        for (stream, payload) in outputs {
            inner.append(stream, payload.clone());
        }
        inner.ack(ack);
        Ok(())
    }

    async fn next_sequence(&self, key: &str) -> StoreResult<u64> {
        let mut inner = self.lock()?;
        let counter = inner.counters.entry(key.to_owned()).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn stage_contributors(&self, batch: &ContributorBatch) -> StoreResult<u64> {
        let mut inner = self.lock()?;
        let mut added = 0;
        let map = inner.hashes.entry(batch.map_key.clone()).or_default();
        for (field, value) in &batch.contributors {
            if !map.contains_key(field) {
                map.insert(field.clone(), value.clone());
                added += 1;
            }
        }
        for (map_key, field, value) in &batch.history_writes {
            inner
                .hashes
                .entry(map_key.clone())
                .or_default()
                .insert(field.clone(), value.clone());
        }
        // Nothing new leaves the counter untouched (and uncreated).
        if added > 0 {
            let counter = inner.counters.entry(batch.counter_key.clone()).or_insert(0);
            *counter += added;
            Ok(*counter)
        } else {
            Ok(inner.counters.get(&batch.counter_key).copied().unwrap_or(0))
        }
    }

    async fn read_map(&self, map_key: &str) -> StoreResult<BTreeMap<String, String>> {
        Ok(self.lock()?.hashes.get(map_key).cloned().unwrap_or_default())
    }

    async fn emit_joined(
        &self,
        map_key: &str,
        counter_key: &str,
        output_stream: &str,
        payload: Payload,
        ack: &AckToken,
    ) -> StoreResult<()> {
        let mut inner = self.lock()?;
        inner.hashes.remove(map_key);
        inner.counters.remove(counter_key);
        inner.append(output_stream, payload);
        inner.ack(ack);
        Ok(())
    }

    async fn claim_abandoned(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> StoreResult<Vec<StreamEntry>> {
        let mut inner = self.lock()?;
        let now = Instant::now();
        let Some(StreamState { entries, groups }) = inner.streams.get_mut(stream) else {
            return Ok(Vec::new());
        };
        let Some(group_state) = groups.get_mut(group) else {
            return Ok(Vec::new());
        };

        let mut claimable: Vec<EntryId> = group_state
            .pending
            .iter()
            .filter(|(_, p)| now.duration_since(p.delivered_at) >= min_idle)
            .map(|(id, _)| *id)
            .collect();
        claimable.sort();
        claimable.truncate(count);

        let mut out = Vec::with_capacity(claimable.len());
        for id in claimable {
            let pending = group_state
                .pending
                .get_mut(&id)
                .ok_or_else(|| StoreError::MalformedReply("pending entry vanished".into()))?;
            pending.consumer = consumer.to_owned();
            pending.delivered_at = now;
            pending.deliveries += 1;
            let deliveries = pending.deliveries;
            let (_, payload) = entries[pending.index].clone();
            out.push(StreamEntry {
                stream: stream.to_owned(),
                id,
                payload,
                deliveries,
            });
        }
        Ok(out)
    }

    async fn try_lock(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let mut inner = self.lock()?;
        let now = Instant::now();
        match inner.locks.get(key) {
            Some(expiry) if *expiry > now => Ok(false),
            _ => {
                inner.locks.insert(key.to_owned(), now + ttl);
                Ok(true)
            }
        }
    }

    async fn unlock(&self, key: &str) -> StoreResult<()> {
        self.lock()?.locks.remove(key);
        Ok(())
    }

    async fn stream_len(&self, stream: &str) -> StoreResult<u64> {
        Ok(self
            .lock()?
            .streams
            .get(stream)
            .map(|s| s.entries.len() as u64)
            .unwrap_or(0))
    }

    async fn read_after(
        &self,
        stream: &str,
        after: Option<EntryId>,
        count: usize,
    ) -> StoreResult<Vec<StreamEntry>> {
        let inner = self.lock()?;
        let Some(state) = inner.streams.get(stream) else {
            return Ok(Vec::new());
        };
        Ok(state
            .entries
            .iter()
            .filter(|(id, _)| after.is_none_or(|a| *id > a))
            .take(count)
            .map(|(id, payload)| StreamEntry {
                stream: stream.to_owned(),
                id: *id,
                payload: payload.clone(),
                deliveries: 0,
            })
            .collect())
    }
}
