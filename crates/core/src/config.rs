//! Process configuration.
//!
//! A single `Config` value is loaded by the supervisor and passed to each
//! stage constructor. Stages never read the environment themselves.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{CoreError, CoreResult};

/// Where a freshly registered consumer group starts reading.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadStart {
    /// Only messages appended after registration (`$`).
    Latest,
    /// The whole stream from the beginning (`0`).
    Beginning,
}

impl ReadStart {
    /// The cursor string understood by the log store.
    pub fn cursor(self) -> &'static str {
        match self {
            Self::Latest => "$",
            Self::Beginning => "0",
        }
    }
}

/// Engine-wide configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Log store endpoint.
    pub redis_uri: String,
    /// Separator used in every stream and key name.
    pub special_char: char,
    /// Reserved message-id field name.
    pub msg_id_field: String,
    /// Namespace for derived-field output streams.
    pub artificial_namespace: String,
    /// Per-stage worker count when the model does not specify one.
    pub default_workers: usize,
    /// Messages fetched per read in the worker loop.
    pub read_chunk_length: usize,
    /// Block timeout of the worker read loop; bounds shutdown latency.
    pub read_block: Duration,
    /// Idle time after which another worker's pending message may be claimed.
    pub claim_idle: Duration,
    /// Start cursor for newly registered consumer groups.
    pub read_start: ReadStart,
}

impl Default for Config {
    fn default() -> Self {
        let special_char = ':';
        Self {
            redis_uri: "redis://localhost".to_owned(),
            special_char,
            msg_id_field: format!("{special_char}_msg_id"),
            artificial_namespace: "artificial".to_owned(),
            default_workers: 4,
            read_chunk_length: 100,
            read_block: Duration::from_millis(1000),
            claim_idle: Duration::from_millis(60_000),
            read_start: ReadStart::Latest,
        }
    }
}

impl Config {
    /// Load configuration from the environment, falling back to defaults.
    ///
    /// Malformed numeric values are rejected rather than silently replaced,
    /// so a typo in a deployment manifest is caught at startup.
    pub fn from_env() -> CoreResult<Self> {
        let mut config = Self::default();

        if let Ok(uri) = std::env::var("REDIS_URI") {
            config.redis_uri = uri;
        }
        if let Ok(raw) = std::env::var("SPECIAL_CHAR") {
            let mut chars = raw.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => config.special_char = c,
                _ => {
                    return Err(CoreError::InvalidConfig {
                        name: "SPECIAL_CHAR",
                        value: raw,
                    });
                }
            }
            config.msg_id_field = format!("{}_msg_id", config.special_char);
        }
        if let Ok(field) = std::env::var("MSG_ID_FIELD") {
            config.msg_id_field = field;
        }
        if let Ok(ns) = std::env::var("ARTIFICIAL_NAMESPACE") {
            config.artificial_namespace = ns;
        }
        config.default_workers =
            parse_env("DEFAULT_WORKERS", config.default_workers)?;
        config.read_chunk_length =
            parse_env("READ_CHUNK_LENGTH", config.read_chunk_length)?;
        config.read_block = Duration::from_millis(parse_env(
            "READ_BLOCK_MS",
            config.read_block.as_millis() as u64,
        )?);
        config.claim_idle = Duration::from_millis(parse_env(
            "CLAIM_IDLE_MS",
            config.claim_idle.as_millis() as u64,
        )?);
        if let Ok(raw) = std::env::var("READ_START") {
            config.read_start = match raw.as_str() {
                "$" => ReadStart::Latest,
                "0" => ReadStart::Beginning,
                _ => {
                    return Err(CoreError::InvalidConfig {
                        name: "READ_START",
                        value: raw,
                    });
                }
            };
        }

        if config.read_chunk_length == 0 {
            warn!("READ_CHUNK_LENGTH of 0 makes no progress; using 1");
            config.read_chunk_length = 1;
        }

        Ok(config)
    }
}

fn parse_env<T: std::str::FromStr>(name: &'static str, default: T) -> CoreResult<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| CoreError::InvalidConfig { name, value: raw }),
        Err(_) => Ok(default),
    }
}
