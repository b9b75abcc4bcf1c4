//! # Object Walker
//!
//! Pure recursive transform over value graphs. The walker knows nothing about
//! tickets or directions; the injected transform decides which leaves to
//! substitute, which is how one traversal serves both marshal (function →
//! ticket) and unmarshal (ticket → function).
//!
//! ## Invariants
//! - Arrays keep order and length; objects keep every key.
//! - A `Function` leaf the transform declined is a hard error: the protocol
//!   only supports JSON-safe graphs plus function leaves the current
//!   direction knows how to substitute.

use std::collections::BTreeMap;

use crate::value::Error;
use crate::value::Result;
use crate::value::Value;

/// Walks `value`, consulting `transform` at every node first. A
/// `Some(replacement)` substitutes the node without recursing into it.
pub fn walk<F>(value: &Value, transform: &mut F) -> Result<Value>
where
    F: FnMut(&Value) -> Result<Option<Value>>,
{
    if let Some(replacement) = transform(value)? {
        return Ok(replacement);
    }

    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => Ok(value.clone()),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(walk(item, transform)?);
            }
            Ok(Value::Array(out))
        }
        Value::Object(map) => {
            let mut out = BTreeMap::new();
            for (key, entry) in map {
                out.insert(key.clone(), walk(entry, transform)?);
            }
            Ok(Value::Object(out))
        }
        Value::Function(f) => {
            Err(Error::BadValue(format!("{:?} was not handled by the transform", f)))
        }
    }
}
