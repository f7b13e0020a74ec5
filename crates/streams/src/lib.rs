//! Log-store contract and backends.
//!
//! The pipeline talks to an append-only log with consumer groups through the
//! [`StreamStore`] trait. Two backends live here: an in-memory store for
//! tests and single-process development, and a Redis Streams store (behind
//! the `redis` feature) for production.

pub mod entry;
pub mod error;
pub mod in_memory;
pub mod store;

#[cfg(feature = "redis")]
pub mod redis_streams;

pub use entry::{AckToken, EntryId, StreamEntry};
pub use error::{StoreError, StoreResult};
pub use in_memory::InMemoryStore;
pub use store::{ContributorBatch, StreamStore};

#[cfg(feature = "redis")]
pub use redis_streams::RedisStore;
