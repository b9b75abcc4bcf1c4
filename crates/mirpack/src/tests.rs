//! Tests for the value model, walker, and envelope.

use std::collections::BTreeMap;

use crate::envelope;
use crate::value::Error;
use crate::value::FuncError;
use crate::value::FuncRef;
use crate::value::Value;
use crate::walk::walk;

fn noop_func() -> FuncRef {
    FuncRef::new(|_args| async { Ok(Value::Null) })
}

#[test]
fn test_json_round_trip_preserves_shape() {
    let value = Value::object([
        ("flag", Value::Bool(true)),
        ("count", Value::from(3)),
        ("label", Value::from("hi")),
        ("items", Value::Array(vec![Value::Null, Value::from(1.5)])),
        ("nested", Value::object([("inner", Value::from("deep"))])),
    ]);

    let json = value.to_json().expect("pure data serializes");
    assert_eq!(Value::from_json(&json), value);
}

#[test]
fn test_to_json_rejects_function_leaves() {
    let value = Value::object([("f", Value::Function(noop_func()))]);
    match value.to_json() {
        Err(Error::BadValue(_)) => {}
        other => panic!("Expected BadValue, got {:?}", other),
    }
}

#[test]
fn test_to_json_rejects_non_finite_numbers() {
    let value = Value::Number(f64::NAN);
    assert!(matches!(value.to_json(), Err(Error::BadValue(_))));
}

#[test]
fn test_func_identity_is_allocation_identity() {
    let f = noop_func();
    let clone = f.clone();
    let other = noop_func();

    assert_eq!(f.key(), clone.key());
    assert_ne!(f.key(), other.key());
    assert_eq!(f, clone);
    assert_ne!(f, other);
}

#[test]
fn test_weak_func_ref_does_not_keep_alive() {
    let f = noop_func();
    let weak = f.downgrade();
    assert!(weak.upgrade().is_some());
    drop(f);
    assert!(weak.upgrade().is_none());
}

#[tokio::test]
async fn test_func_ref_invocation() {
    let double = FuncRef::named("double", |args: Vec<Value>| async move {
        let n = args
            .first()
            .and_then(Value::as_number)
            .ok_or_else(|| FuncError::thrown("expected a number"))?;
        Ok(Value::from(n * 2.0))
    });

    let out = double.call(vec![Value::from(21)]).await.expect("call succeeds");
    assert_eq!(out, Value::from(42));

    let err = double.call(vec![]).await.expect_err("missing arg rejects");
    assert_eq!(err.name, "Error");
}

#[test]
fn test_walk_passes_primitives_through() {
    let mut transform = |_: &Value| Ok(None);
    for value in [Value::Null, Value::Bool(false), Value::from(7), Value::from("x")] {
        assert_eq!(walk(&value, &mut transform).expect("walk"), value);
    }
}

#[test]
fn test_walk_substitutes_recognized_leaves() {
    let value = Value::Array(vec![
        Value::from(1),
        Value::object([("f", Value::Function(noop_func()))]),
    ]);

    let out = walk(&value, &mut |v| match v {
        Value::Function(_) => Ok(Some(Value::from("ticketed"))),
        _ => Ok(None),
    })
    .expect("walk");

    assert_eq!(
        out,
        Value::Array(vec![Value::from(1), Value::object([("f", Value::from("ticketed"))])]),
    );
}

#[test]
fn test_walk_preserves_order_and_keys() {
    let value = Value::Array(vec![Value::from(1), Value::from(2), Value::from(3)]);
    let out = walk(&value, &mut |_| Ok(None)).expect("walk");
    assert_eq!(out, value);

    let mut map = BTreeMap::new();
    map.insert("a".to_string(), Value::from(1));
    map.insert("z".to_string(), Value::Null);
    let value = Value::Object(map.clone());
    let out = walk(&value, &mut |_| Ok(None)).expect("walk");
    assert_eq!(out, Value::Object(map));
}

#[test]
fn test_walk_rejects_unhandled_functions() {
    let value = Value::object([("f", Value::Function(noop_func()))]);
    let result = walk(&value, &mut |_| Ok(None));
    assert!(matches!(result, Err(Error::BadValue(_))));
}

#[test]
fn test_walk_substitution_does_not_recurse() {
    // A replacement containing a function leaf is kept verbatim.
    let marker = noop_func();
    let replacement = Value::Function(marker.clone());
    let out = walk(&Value::from("leaf"), &mut |v| match v {
        Value::String(_) => Ok(Some(replacement.clone())),
        _ => Ok(None),
    })
    .expect("walk");
    assert_eq!(out.as_func().map(FuncRef::key), Some(marker.key()));
}

#[test]
fn test_envelope_wrap_unwrap() {
    let payload = serde_json::json!({"fnId": "f_1"});
    let wrapped = envelope::wrap(payload.clone());
    assert_eq!(envelope::unwrap(&wrapped), Some(&payload));
}

#[test]
fn test_envelope_rejects_wrong_shape() {
    // Extra keys, wrong key, or non-objects are not protocol traffic.
    let mut extra = serde_json::Map::new();
    extra.insert(envelope::ROOT_KEY.to_string(), serde_json::Value::Null);
    extra.insert("other".to_string(), serde_json::Value::Null);
    assert!(envelope::unwrap(&serde_json::Value::Object(extra)).is_none());

    assert!(envelope::unwrap(&serde_json::json!({"key": 1})).is_none());
    assert!(envelope::unwrap(&serde_json::json!([1, 2])).is_none());
    assert!(envelope::unwrap(&serde_json::json!("text")).is_none());
}

#[test]
fn test_envelope_value_form() {
    let payload = Value::object([("fnId", Value::from("f_1"))]);
    let wrapped = envelope::wrap_value(payload.clone());
    assert_eq!(envelope::unwrap_value(&wrapped), Some(&payload));
    assert!(envelope::unwrap_value(&payload).is_none());
}
