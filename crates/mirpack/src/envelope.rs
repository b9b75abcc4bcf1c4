//! # Wire Envelope
//!
//! Every protocol message is exactly one payload wrapped once under a single
//! well-known root key, so protocol traffic is distinguishable from
//! incidental data sharing the same channel. A message that is not an object
//! with exactly that one key is not protocol traffic.

use std::collections::BTreeMap;

use crate::value::Value;

/// The one fixed root key for the whole protocol.
pub const ROOT_KEY: &str = "__mir_rpc__";

/// Wraps a JSON payload in the envelope.
pub fn wrap(payload: serde_json::Value) -> serde_json::Value {
    let mut map = serde_json::Map::with_capacity(1);
    map.insert(ROOT_KEY.to_string(), payload);
    serde_json::Value::Object(map)
}

/// Unwraps a JSON envelope. Returns `None` unless `message` is an object with
/// exactly one key equal to [`ROOT_KEY`].
pub fn unwrap(message: &serde_json::Value) -> Option<&serde_json::Value> {
    let map = message.as_object()?;
    if map.len() != 1 {
        return None;
    }
    map.get(ROOT_KEY)
}

/// Wraps a payload in the envelope, in value-graph form. Marshaled function
/// tickets appear inside value graphs in this shape.
pub fn wrap_value(payload: Value) -> Value {
    let mut map = BTreeMap::new();
    map.insert(ROOT_KEY.to_string(), payload);
    Value::Object(map)
}

/// Unwraps a value-graph envelope, with the same exactly-one-key validation
/// as [`unwrap`].
pub fn unwrap_value(value: &Value) -> Option<&Value> {
    match value {
        Value::Object(map) if map.len() == 1 => map.get(ROOT_KEY),
        _ => None,
    }
}
