//! End-to-end connection tests over an in-process realm pair.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use mirpack::FuncError;
use mirpack::FuncRef;
use mirpack::Value;
use mirrun::Connection;
use mirrun::LocalRealm;
use mirrun::Origin;
use mirrun::TunnelConfig;
use mirrun::connect::Error;
use mirrun::connect_to_child;
use mirrun::connect_to_parent;
use mirrun::tunnel;

const PARENT_ORIGIN: &str = "https://parent.example";
const CHILD_ORIGIN: &str = "https://child.example";

/// Run with RUST_LOG=mirrpc=debug,mirrun=debug to watch the handshake.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn config(target: &str) -> TunnelConfig {
    TunnelConfig {
        target_origin: Origin::Exact(target.to_string()),
        timeout_ms: 2_000,
        retry_interval_ms: 25,
        liveness_interval_ms: 25,
        ..TunnelConfig::default()
    }
}

fn parent_api() -> Value {
    let add = FuncRef::named("add", |args: Vec<Value>| async move {
        let a = args[0].as_number().unwrap_or_default();
        let b = args[1].as_number().unwrap_or_default();
        Ok(Value::from(a + b))
    });
    Value::object([("math", Value::object([("add", Value::from(add))]))])
}

fn child_api(greeting: &str) -> Value {
    let greeting = greeting.to_string();
    let greet = FuncRef::named("greet", move |_args| {
        let greeting = greeting.clone();
        async move { Ok(Value::from(greeting)) }
    });
    let notify = FuncRef::named("notify", |args: Vec<Value>| async move {
        let callback = args[0]
            .as_func()
            .cloned()
            .ok_or_else(|| FuncError::bad_value("expected a callback"))?;
        callback.call(vec![Value::from("ready")]).await?;
        Ok(Value::Null)
    });
    Value::object([
        ("greet", Value::from(greet)),
        ("notify", Value::from(notify)),
    ])
}

async fn connected_pair() -> anyhow::Result<(Connection, Connection)> {
    init_tracing();
    let (parent_realm, child_realm) = LocalRealm::pair(PARENT_ORIGIN, CHILD_ORIGIN);
    let parent = connect_to_child(Arc::new(parent_realm), parent_api(), config(CHILD_ORIGIN));
    let child = connect_to_parent(Arc::new(child_realm), child_api("hi"), config(PARENT_ORIGIN));
    let (parent, child) = tokio::join!(parent, child);
    Ok((parent?, child?))
}

#[tokio::test]
async fn test_parent_and_child_call_each_other() -> anyhow::Result<()> {
    let (parent, child) = connected_pair().await?;

    let sum = child
        .remote()
        .at("math")
        .at("add")
        .call(vec![Value::from(2), Value::from(3)])
        .await?;
    assert_eq!(sum, Value::from(5));

    let greeting = parent.remote().at("greet").call(vec![]).await?;
    assert_eq!(greeting, Value::from("hi"));
    Ok(())
}

#[tokio::test]
async fn test_callbacks_cross_the_boundary_both_ways() -> anyhow::Result<()> {
    let (parent, _child) = connected_pair().await?;

    let heard = Arc::new(Mutex::new(None));
    let sink = heard.clone();
    let on_ready = FuncRef::named("onReady", move |args: Vec<Value>| {
        let sink = sink.clone();
        async move {
            *sink.lock().unwrap() = args[0].as_str().map(str::to_string);
            Ok(Value::Null)
        }
    });

    parent
        .remote()
        .at("notify")
        .call(vec![Value::from(on_ready)])
        .await?;
    assert_eq!(*heard.lock().unwrap(), Some("ready".to_string()));
    Ok(())
}

#[tokio::test]
async fn test_shared_context_is_local_to_each_side() -> anyhow::Result<()> {
    let (parent, child) = connected_pair().await?;

    parent.context().set("session", Value::from("abc"));
    assert_eq!(parent.context().get("session"), Some(Value::from("abc")));
    assert!(child.context().get("session").is_none());
    Ok(())
}

#[tokio::test]
async fn test_destroy_rejects_the_peers_calls() -> anyhow::Result<()> {
    let (parent, child) = connected_pair().await?;

    child.destroy(Some("navigating away".to_string()));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = parent.remote().at("greet").call(vec![]).await.unwrap_err();
    match err {
        mirrun::path::Error::Call(e) => assert!(e.is_disconnection()),
        other => panic!("expected a call rejection, got {}", other),
    }
    assert!(child.is_destroyed());
    Ok(())
}

#[tokio::test]
async fn test_child_reload_replaces_the_remote_tree_in_place() -> anyhow::Result<()> {
    let (parent_realm, child_realm) = LocalRealm::pair(PARENT_ORIGIN, CHILD_ORIGIN);
    let parent_realm: Arc<LocalRealm> = Arc::new(parent_realm);
    let child_realm: Arc<LocalRealm> = Arc::new(child_realm);

    let parent = connect_to_child(parent_realm.clone(), parent_api(), config(CHILD_ORIGIN));
    let child = connect_to_parent(child_realm.clone(), child_api("before"), config(PARENT_ORIGIN));
    let (parent, child) = tokio::join!(parent, child);
    let parent = parent?;
    let _first_child = child?;

    let greet = parent.remote().at("greet");
    assert_eq!(greet.call(vec![]).await?, Value::from("before"));
    let stale_stub = greet.get()?.as_func().cloned().expect("greet is a function");

    // The child realm reloads: a brand-new connection attempt over the same
    // boundary. The parent's listener reconnects the existing emitter.
    let _second_child =
        connect_to_parent(child_realm.clone(), child_api("after"), config(PARENT_ORIGIN)).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The same path now dispatches into the replacement tree.
    assert_eq!(greet.call(vec![]).await?, Value::from("after"));

    // Tickets from before the reload are invalid; the old stub fails loudly.
    let err = stale_stub.call(vec![]).await.unwrap_err();
    assert!(err.is_disconnection());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_wrong_origin_offers_never_connect() {
    let (parent_realm, evil_realm) = LocalRealm::pair(PARENT_ORIGIN, "https://evil.example");

    let short = |target: &str| TunnelConfig {
        timeout_ms: 200,
        ..config(target)
    };

    let parent = connect_to_child(Arc::new(parent_realm), parent_api(), short(CHILD_ORIGIN));
    let evil = connect_to_parent(Arc::new(evil_realm), child_api("hi"), short(PARENT_ORIGIN));
    let (parent, evil) = tokio::join!(parent, evil);

    assert!(matches!(parent, Err(Error::Tunnel(tunnel::Error::Timeout { .. }))));
    assert!(matches!(evil, Err(Error::Tunnel(tunnel::Error::Timeout { .. }))));
}

#[tokio::test(start_paused = true)]
async fn test_listener_gives_up_when_the_counterpart_detaches() {
    let (parent_realm, child_realm) = LocalRealm::pair(PARENT_ORIGIN, CHILD_ORIGIN);

    let attempt = tokio::spawn(connect_to_child(
        Arc::new(parent_realm),
        parent_api(),
        config(CHILD_ORIGIN),
    ));
    tokio::time::sleep(Duration::from_millis(60)).await;
    child_realm.detach();

    let outcome = attempt.await.expect("connect task panicked");
    assert!(matches!(outcome, Err(Error::Tunnel(tunnel::Error::Detached))));
}
