//! Stream and key naming conventions.
//!
//! Every name the engine touches is produced here, from the configured
//! separator. Layout on the wire:
//!
//! - `:NAME`: raw input (and terminal report) streams
//! - `:NAME:split`: post-split stream for an input namespace
//! - `:FIELD:deps`: joined-dependency stream feeding a generator
//! - `:artificial:FIELD`: derived-field output stream
//! - `:depmap:STREAM:MSG_ID` (+ `:incr`): pending accumulator hash/counter
//! - `:id:OBJ`: per-entity sequence counter

use crate::config::Config;
use crate::message::MessageId;

/// Name of the advisory lock guarding consumer-group registration.
pub const REGISTER_LOCK_KEY: &str = "REGISTERLOCK";

/// Builds stream and key names for one configured namespace separator.
#[derive(Debug, Clone)]
pub struct KeySpace {
    sep: char,
    artificial_namespace: String,
    msg_id_field: String,
}

impl KeySpace {
    pub fn new(config: &Config) -> Self {
        Self {
            sep: config.special_char,
            artificial_namespace: config.artificial_namespace.clone(),
            msg_id_field: config.msg_id_field.clone(),
        }
    }

    /// Reserved message-id field name (`:_msg_id` by default).
    pub fn msg_id_field(&self) -> &str {
        &self.msg_id_field
    }

    /// Raw input stream for an input kind: `:NAME`.
    pub fn input_stream(&self, name: &str) -> String {
        format!("{}{}", self.sep, name)
    }

    /// Post-split stream for an input namespace: `:NAME:split`.
    pub fn split_stream(&self, namespace: &str) -> String {
        format!("{0}{1}{0}split", self.sep, namespace)
    }

    /// Joined-dependency stream for a derived field: `:FIELD:deps`.
    pub fn deps_stream(&self, field: &str) -> String {
        format!("{0}{1}{0}deps", self.sep, field)
    }

    /// Derived-field output stream: `:artificial:FIELD`.
    pub fn artificial_stream(&self, field: &str) -> String {
        format!("{0}{1}{0}{2}", self.sep, self.artificial_namespace, field)
    }

    /// Terminal stream for an output report: `:NAME`.
    pub fn report_stream(&self, name: &str) -> String {
        format!("{}{}", self.sep, name)
    }

    /// Pending-accumulator hash for a resolver output stream and message:
    /// `:depmap:STREAM:MSG_ID`.
    pub fn dependency_map_key(&self, output_stream: &str, msg_id: &MessageId) -> String {
        format!("{0}depmap{1}{0}{2}", self.sep, output_stream, msg_id)
    }

    /// Counter paired with an accumulator hash.
    pub fn dependency_counter_key(&self, map_key: &str) -> String {
        format!("{0}{1}incr", map_key, self.sep)
    }

    /// Positional field for a historical dependency: `{dst_key}:{position}`.
    pub fn history_field(&self, dst_key: &str, position: u64) -> String {
        format!("{}{}{}", dst_key, self.sep, position)
    }

    /// Per-entity sequence key: `:id:OBJ`.
    pub fn sequence_key(&self, object_id: &str) -> String {
        format!("{0}id{0}{1}", self.sep, object_id)
    }

    /// Dead-letter stream for a consumer group: `:dlq:GROUP`.
    pub fn dlq_stream(&self, group: &str) -> String {
        format!("{0}dlq{0}{1}", self.sep, group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keyspace() -> KeySpace {
        KeySpace::new(&Config::default())
    }

    #[test]
    fn names_follow_the_wire_convention() {
        let ks = keyspace();
        assert_eq!(ks.input_stream("ztm-report"), ":ztm-report");
        assert_eq!(ks.split_stream("ztm-report"), ":ztm-report:split");
        assert_eq!(ks.deps_stream("direction"), ":direction:deps");
        assert_eq!(ks.artificial_stream("direction"), ":artificial:direction");
        assert_eq!(ks.report_stream("location-report"), ":location-report");
        assert_eq!(ks.sequence_key("Vehicle 1"), ":id:Vehicle 1");
        assert_eq!(ks.dlq_stream("direction.deps"), ":dlq:direction.deps");
    }

    #[test]
    fn accumulator_keys_pair_hash_and_counter() {
        let ks = keyspace();
        let msg_id = MessageId::new("V1", 3);
        let map_key = ks.dependency_map_key(":direction:deps", &msg_id);
        assert_eq!(map_key, ":depmap:direction:deps:V1:3");
        assert_eq!(
            ks.dependency_counter_key(&map_key),
            ":depmap:direction:deps:V1:3:incr"
        );
    }

    #[test]
    fn history_fields_are_positional() {
        assert_eq!(keyspace().history_field("lat", 0), "lat:0");
        assert_eq!(keyspace().history_field("lat", 4), "lat:4");
    }
}
