//! The log-store contract every stage runs against.
//!
//! At-least-once delivery is the baseline; stages must be idempotent on the
//! reserved message id. The trait exposes the handful of *atomic* compound
//! operations the pipeline's correctness rests on (sequence increment,
//! contributor staging, emission) rather than a generic pipeline builder, so
//! that each backend can realize atomicity its own way.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;

use streamforge_core::{Payload, ReadStart};

use crate::entry::{AckToken, EntryId, StreamEntry};
use crate::error::StoreResult;

/// One atomic accumulator update performed by a dependency resolver.
///
/// Contributors are written only if their field is still absent, the counter
/// advances by the number of fields actually written, and the historical
/// pre-writes land in *future* accumulators, all in one linearized step.
/// The counter value after the update is the emission decision.
#[derive(Debug, Clone, Default)]
pub struct ContributorBatch {
    /// Accumulator hash key for the current message.
    pub map_key: String,
    /// Counter key paired with the hash.
    pub counter_key: String,
    /// `dst_key → encoded value`, written if absent.
    pub contributors: Vec<(String, String)>,
    /// `(future map key, positional field, encoded value)`, plain overwrite.
    pub history_writes: Vec<(String, String, String)>,
}

/// Append-only log with consumer groups, hashes, and counters.
///
/// Implementations: [`crate::InMemoryStore`] for tests and single-process
/// development, and the Redis backend (`redis` feature) for production.
#[async_trait]
pub trait StreamStore: Send + Sync + 'static {
    /// Register a consumer group on `stream`, creating the stream if needed.
    /// Registering an existing group is a no-op.
    async fn ensure_group(
        &self,
        stream: &str,
        group: &str,
        start: ReadStart,
    ) -> StoreResult<()>;

    /// Append a payload; returns the log-assigned entry key.
    async fn append(&self, stream: &str, payload: Payload) -> StoreResult<EntryId>;

    /// Read up to `count` new messages for `consumer` within `group` across
    /// `streams`, blocking up to `block`. An empty result means the block
    /// timed out.
    async fn read_group(
        &self,
        streams: &[String],
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> StoreResult<Vec<StreamEntry>>;

    /// Acknowledge one in-flight entry.
    async fn ack(&self, token: &AckToken) -> StoreResult<()>;

    /// Atomically append `outputs` and acknowledge the input that produced
    /// them. This is the splitter/generator commit step: either the outputs
    /// and the ack both land, or neither does.
    async fn append_and_ack(
        &self,
        outputs: &[(String, Payload)],
        ack: &AckToken,
    ) -> StoreResult<()>;

    /// Atomic post-increment of an integer key; the sequencing point for
    /// per-entity ordering. First call returns 1.
    async fn next_sequence(&self, key: &str) -> StoreResult<u64>;

    /// Apply one [`ContributorBatch`] and return the counter value after it.
    async fn stage_contributors(&self, batch: &ContributorBatch) -> StoreResult<u64>;

    /// Read a whole accumulator hash.
    async fn read_map(&self, map_key: &str) -> StoreResult<BTreeMap<String, String>>;

    /// Atomically delete accumulator state, append the joined record, and
    /// acknowledge the input. Keeping deletion in the same step as emission
    /// means a crash can duplicate the record but never orphan the hash.
    async fn emit_joined(
        &self,
        map_key: &str,
        counter_key: &str,
        output_stream: &str,
        payload: Payload,
        ack: &AckToken,
    ) -> StoreResult<()>;

    /// Claim entries left pending by other consumers for longer than
    /// `min_idle`, reassigning them to `consumer`.
    async fn claim_abandoned(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> StoreResult<Vec<StreamEntry>>;

    /// Try to take a TTL-bounded advisory lock. Returns `false` if someone
    /// else holds it. The TTL keeps a crashed holder from wedging everyone.
    async fn try_lock(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    /// Release an advisory lock.
    async fn unlock(&self, key: &str) -> StoreResult<()>;

    /// Number of entries in a stream (0 for a missing stream).
    async fn stream_len(&self, stream: &str) -> StoreResult<u64>;

    /// Read entries outside any group, strictly after `after` (or from the
    /// beginning). Used for tailing terminal streams.
    async fn read_after(
        &self,
        stream: &str,
        after: Option<EntryId>,
        count: usize,
    ) -> StoreResult<Vec<StreamEntry>>;
}
