//! Stream entries as delivered by the log store.

use std::fmt;
use std::str::FromStr;

use streamforge_core::Payload;

use crate::error::StoreError;

/// Log-assigned entry key of the form `<ms-epoch>-<seq>`.
///
/// Ordered the way the log orders entries: by timestamp, then by the per-ms
/// sequence. This is a transport-level key; pipeline identity is carried by
/// the reserved message-id payload field instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId {
    millis: u64,
    seq: u64,
}

impl EntryId {
    pub fn new(millis: u64, seq: u64) -> Self {
        Self { millis, seq }
    }

    pub fn millis(&self) -> u64 {
        self.millis
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

impl FromStr for EntryId {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (millis, seq) = s
            .split_once('-')
            .ok_or_else(|| StoreError::MalformedReply(format!("entry id {s:?}")))?;
        let parse = |part: &str| {
            part.parse::<u64>()
                .map_err(|_| StoreError::MalformedReply(format!("entry id {s:?}")))
        };
        Ok(Self {
            millis: parse(millis)?,
            seq: parse(seq)?,
        })
    }
}

/// One message delivered from a stream.
#[derive(Debug, Clone)]
pub struct StreamEntry {
    /// Stream the entry was read from.
    pub stream: String,
    /// Log-assigned key.
    pub id: EntryId,
    /// Field map as it sits on the wire.
    pub payload: Payload,
    /// How many times the group has delivered this entry (1 for the first
    /// delivery; claims of abandoned entries increment it).
    pub deliveries: u64,
}

/// Everything needed to acknowledge an in-flight entry.
#[derive(Debug, Clone)]
pub struct AckToken {
    pub stream: String,
    pub group: String,
    pub id: EntryId,
}

impl StreamEntry {
    /// Acknowledgement token for this entry within `group`.
    pub fn ack_token(&self, group: &str) -> AckToken {
        AckToken {
            stream: self.stream.clone(),
            group: group.to_owned(),
            id: self.id,
        }
    }
}
