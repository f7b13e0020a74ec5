//! Self-describing value encoding for stream payloads.
//!
//! Every payload field travels as a JSON token: numbers and booleans bare,
//! strings quoted, structured values as arrays/objects. Raw client input may
//! predate the convention, so decoding falls back to treating unparseable
//! text as a plain string instead of failing.

use serde_json::Value;

/// Encode a value as its wire representation.
///
/// Round-trip property: `decode_value(&encode_value(v)) == v` for every
/// representable `v`.
pub fn encode_value(value: &Value) -> String {
    value.to_string()
}

/// Decode a wire token back into a value.
///
/// Unparseable input decodes as a string, which makes raw (unencoded) client
/// fields such as bare entity identifiers usable without a schema.
pub fn decode_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_owned()))
}
