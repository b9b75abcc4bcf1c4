use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use mirpack::FuncRef;
use mirpack::Value;
use mirrpc::ticket;
use mirrpc::ticket::HandshakeOffered;

use crate::connect::SharedContext;
use crate::local::LocalRealm;
use crate::path;
use crate::path::RemotePath;
use crate::realm::Origin;
use crate::realm::Realm;
use crate::realm::RealmMsg;
use crate::tunnel;
use crate::tunnel::HANDSHAKE_KEY_LEN;
use crate::tunnel::Tunnel;
use crate::tunnel::TunnelConfig;
use crate::tunnel::handshake_key;

#[test]
fn test_origin_matching() {
    let exact = Origin::Exact("https://child.example".to_string());
    assert!(exact.accepts("https://child.example"));
    assert!(!exact.accepts("https://evil.example"));
    assert!(Origin::Any.accepts("anything"));
}

#[test]
fn test_handshake_keys_are_fixed_length_base36() {
    for _ in 0..32 {
        let key = handshake_key();
        assert_eq!(key.len(), HANDSHAKE_KEY_LEN);
        assert!(key.chars().all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
    }
}

#[tokio::test]
async fn test_local_realms_stamp_their_own_origin() {
    let (a, b) = LocalRealm::pair("origin-a", "origin-b");

    // A claimed origin is overwritten by the posting realm's own.
    let mut msg = RealmMsg::new(serde_json::json!({"n": 1}));
    msg.origin = "https://spoofed.example".to_string();
    a.post(msg).unwrap();

    let received = b.recv().await.unwrap();
    assert_eq!(received.origin, "origin-a");
    assert_eq!(received.data["n"], 1);
}

#[tokio::test]
async fn test_detached_realm_stops_posts_and_liveness() {
    let (a, b) = LocalRealm::pair("origin-a", "origin-b");
    assert!(a.is_attached());

    b.detach();
    assert!(!a.is_attached());
    assert!(a.post(RealmMsg::new(serde_json::Value::Null)).is_err());
}

#[test]
fn test_version_mismatch_warns_once_per_remote_version() {
    let tunnel = Tunnel::new(TunnelConfig::default());

    // Patch-level differences are silently compatible.
    assert!(!tunnel.note_remote_version("1.0.9"));

    assert!(tunnel.note_remote_version("1.1.0"));
    assert!(!tunnel.note_remote_version("1.1.0"));
    assert!(tunnel.note_remote_version("2.0.0"));
    assert!(tunnel.note_remote_version("not-a-version"));

    tunnel.reset_version_warnings();
    assert!(tunnel.note_remote_version("1.1.0"));
}

#[tokio::test(start_paused = true)]
async fn test_initiator_sends_one_offer_per_interval_until_the_timeout() {
    let (silent, initiator) = LocalRealm::pair("parent", "child");

    let tunnel = Tunnel::new(TunnelConfig {
        timeout_ms: 105,
        retry_interval_ms: 20,
        ..TunnelConfig::default()
    });
    let err = tunnel.offer(Arc::new(initiator)).await.unwrap_err();
    assert!(matches!(err, tunnel::Error::Timeout { ms: 105 }));
    assert!(tunnel.emitter().is_destroyed());

    // Offers at 0, 20, ..., 100: ceil(105 / 20) of them.
    let mut offers = 0;
    while let Ok(Some(msg)) =
        tokio::time::timeout(Duration::from_millis(1), silent.recv()).await
    {
        ticket::open::<HandshakeOffered>(&msg.data).unwrap();
        offers += 1;
    }
    assert_eq!(offers, 6);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_handshake_traffic_never_connects_the_initiator() {
    let (noisy, initiator) = LocalRealm::pair("parent", "child");

    // Wrong shapes, wrong keys, no port: none of these may advance the
    // state machine.
    noisy.post(RealmMsg::new(serde_json::json!("junk"))).unwrap();
    noisy
        .post(RealmMsg::new(serde_json::json!({"accepts": "zzzzzz", "version": "1.0.0"})))
        .unwrap();
    noisy
        .post(RealmMsg::new(
            ticket::seal(&ticket::HandshakeAccepted {
                accepts: "zzzzzz".to_string(),
                version: "1.0.0".to_string(),
            })
            .unwrap(),
        ))
        .unwrap();

    let tunnel = Tunnel::new(TunnelConfig {
        timeout_ms: 50,
        retry_interval_ms: 20,
        ..TunnelConfig::default()
    });
    let err = tunnel.offer(Arc::new(initiator)).await.unwrap_err();
    assert!(matches!(err, tunnel::Error::Timeout { .. }));
}

#[test]
fn test_shared_context_stores_values_per_connection() {
    let context = SharedContext::new();
    assert!(context.get("user").is_none());

    context.set("user", Value::from("ada"));
    assert_eq!(context.get("user"), Some(Value::from("ada")));

    let sibling = context.clone();
    sibling.set("theme", Value::from("dark"));
    assert_eq!(context.get("theme"), Some(Value::from("dark")));

    assert_eq!(context.remove("user"), Some(Value::from("ada")));
    assert!(context.get("user").is_none());
}

fn sample_tree() -> Arc<Mutex<Value>> {
    let add = FuncRef::named("add", |args: Vec<Value>| async move {
        let a = args[0].as_number().unwrap_or_default();
        let b = args[1].as_number().unwrap_or_default();
        Ok(Value::from(a + b))
    });
    Arc::new(Mutex::new(Value::object([(
        "math",
        Value::object([("add", Value::from(add))]),
    )])))
}

#[tokio::test]
async fn test_remote_path_calls_the_leaf_it_names() {
    let root = RemotePath::root(sample_tree());
    let sum = root
        .at("math")
        .at("add")
        .call(vec![Value::from(2), Value::from(3)])
        .await
        .unwrap();
    assert_eq!(sum, Value::from(5));
}

#[tokio::test]
async fn test_remote_path_reports_missing_segments() {
    let root = RemotePath::root(sample_tree());
    let err = root.at("math").at("subtract").call(vec![]).await.unwrap_err();
    assert!(matches!(
        err,
        path::Error::MissingSegment { ref segment, .. } if segment == "subtract"
    ));
}

#[tokio::test]
async fn test_remote_path_rejects_non_function_leaves() {
    let root = RemotePath::root(sample_tree());
    let err = root.at("math").call(vec![]).await.unwrap_err();
    assert!(matches!(err, path::Error::NotAFunction { .. }));
}

#[tokio::test]
async fn test_remote_path_resolves_against_the_current_root() {
    let shared = sample_tree();
    let path = RemotePath::root(shared.clone()).at("math").at("add");

    // The tree is replaced underneath the path, as a reload would.
    let doubled = FuncRef::named("add", |args: Vec<Value>| async move {
        let a = args[0].as_number().unwrap_or_default();
        Ok(Value::from(a * 2.0))
    });
    *shared.lock().unwrap() = Value::object([(
        "math",
        Value::object([("add", Value::from(doubled))]),
    )]);

    let result = path.call(vec![Value::from(4), Value::from(0)]).await.unwrap();
    assert_eq!(result, Value::from(8));
}
