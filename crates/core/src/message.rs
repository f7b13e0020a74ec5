//! Message identity and payloads.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Canonical identity of a flowing record: `{obj_id}:{obj_seq}`.
///
/// `obj_id` is the entity identifier chosen by the model; `obj_seq` is the
/// per-entity monotonic counter assigned by the splitter. Delivery is
/// at-least-once everywhere, so this pair, not the log-assigned entry key,
/// is what downstream consumers deduplicate on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId {
    object_id: String,
    sequence: u64,
}

impl MessageId {
    pub fn new(object_id: impl Into<String>, sequence: u64) -> Self {
        Self {
            object_id: object_id.into(),
            sequence,
        }
    }

    pub fn object_id(&self) -> &str {
        &self.object_id
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// The identity `steps` messages ahead for the same entity.
    ///
    /// Historical dependencies are written forward into the accumulators of
    /// future messages; this is how those targets are derived.
    pub fn advance(&self, steps: u64) -> Self {
        Self {
            object_id: self.object_id.clone(),
            sequence: self.sequence + steps,
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.object_id, self.sequence)
    }
}

impl FromStr for MessageId {
    type Err = CoreError;

    /// Parse at the **last** `:`, so object ids containing the separator
    /// (e.g. `line:7`) survive the round trip.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (object_id, seq) = s
            .rsplit_once(':')
            .ok_or_else(|| CoreError::MalformedMessageId(s.to_owned()))?;
        if object_id.is_empty() {
            return Err(CoreError::MalformedMessageId(s.to_owned()));
        }
        let sequence = seq
            .parse()
            .map_err(|_| CoreError::MalformedMessageId(s.to_owned()))?;
        Ok(Self {
            object_id: object_id.to_owned(),
            sequence,
        })
    }
}

/// A stream message payload: field name → encoded value.
///
/// Ordered so that payload comparisons in tests and logs are deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload(BTreeMap<String, String>);

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<String>) {
        self.0.insert(field.into(), value.into());
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.0.get(field).map(String::as_str)
    }

    /// Remove and return a field, typically the reserved message id.
    pub fn remove(&mut self, field: &str) -> Option<String> {
        self.0.remove(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn into_inner(self) -> BTreeMap<String, String> {
        self.0
    }

    /// Fetch a required field.
    pub fn require(&self, field: &str) -> Result<&str, CoreError> {
        self.get(field).ok_or_else(|| CoreError::missing_field(field))
    }
}

impl From<BTreeMap<String, String>> for Payload {
    fn from(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }
}

impl FromIterator<(String, String)> for Payload {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for Payload {
    type Item = (String, String);
    type IntoIter = std::collections::btree_map::IntoIter<String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
