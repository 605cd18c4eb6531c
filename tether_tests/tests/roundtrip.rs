//! Full socket-based tests for the request/reply protocol and the shared
//! reference lifecycle.

use std::sync::Arc;

use tether_core::binder::ShareableObject;
use tether_core::error::RpcError;
use tether_core::value::Value;
use tether_core::wire::{MethodId, ObjectId};
use tether_tests::{connected_pair, init_tracing, wait_until, Counter, RootProxy};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn echo_int_roundtrip() -> anyhow::Result<()> {
    init_tracing();
    let link = connected_pair().await?;
    let root = RootProxy::over(&link.client)?;

    assert_eq!(root.echo(42).await?, 42);
    assert_eq!(link.client.pending_operation_count(), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handshake_assigns_matching_network_ids() -> anyhow::Result<()> {
    init_tracing();
    let link = connected_pair().await?;

    assert_ne!(link.client.network_id().0, 0);
    assert_eq!(link.client.network_id(), link.server.network_id());
    assert!(link.client.is_connected());
    assert!(link.server.is_connected());
    // Each side starts with exactly its root held and the peer root proxied.
    assert_eq!(link.client.held_object_count(), 1);
    assert_eq!(link.server.held_object_count(), 1);
    assert!(link.client.server().is_some());
    assert!(link.server.server().is_some());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn returned_shareables_become_distinct_proxies_and_release() -> anyhow::Result<()> {
    init_tracing();
    let link = connected_pair().await?;
    let root = RootProxy::over(&link.client)?;

    let first = root.new_counter().await?;
    let second = root.new_counter().await?;
    assert!(!Arc::ptr_eq(&first, &second));

    assert_eq!(first.increment().await?, 1);
    assert_eq!(second.increment().await?, 1);

    // Root plus the two counters.
    assert_eq!(link.server.held_object_count(), 3);

    drop(first);
    drop(second);
    let server = link.server.clone();
    wait_until(move || server.held_object_count() == 1).await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn same_object_resolves_to_the_same_proxy() -> anyhow::Result<()> {
    init_tracing();
    let link = connected_pair().await?;
    let root = RootProxy::over(&link.client)?;

    let first = root.shared_counter().await?;
    let second = root.shared_counter().await?;
    assert!(Arc::ptr_eq(&first, &second), "one live proxy per id");

    assert_eq!(first.increment().await?, 1);
    assert_eq!(second.increment().await?, 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn the_protocol_is_symmetric() -> anyhow::Result<()> {
    init_tracing();
    let link = connected_pair().await?;

    // The accepted side drives the client's root the same way.
    let client_root_proxy = RootProxy::over(&link.server)?;
    assert_eq!(client_root_proxy.echo(9).await?, 9);
    client_root_proxy.set_greeting("from the server").await?;
    assert_eq!(link.client_root.greeting(), "from the server");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invocation_body_can_call_back_into_the_caller() -> anyhow::Result<()> {
    init_tracing();
    let link = connected_pair().await?;
    let root = RootProxy::over(&link.client)?;

    // The server-side body issues a nested request to our root and must not
    // starve: its reader stays free while the executor awaits.
    link.client_root.set_greeting("mirror me");
    assert_eq!(root.mirror_greeting().await?, "mirror me");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn property_round_trip() -> anyhow::Result<()> {
    init_tracing();
    let link = connected_pair().await?;
    let root = RootProxy::over(&link.client)?;

    root.set_greeting("hello").await?;
    assert_eq!(root.greeting().await?, "hello");
    assert_eq!(link.server_root.greeting(), "hello");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn indexer_round_trip_and_missing_key() -> anyhow::Result<()> {
    init_tracing();
    let link = connected_pair().await?;
    let root = RootProxy::over(&link.client)?;

    let map = root.new_map().await?;
    map.set("k", "v").await?;
    assert_eq!(map.get("k").await?, "v");

    match map.get("missing").await {
        Err(RpcError::Remote(remote)) => assert_eq!(remote.type_name, "KeyNotFound"),
        other => panic!("expected a remote KeyNotFound, got {other:?}"),
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shared_reference_round_trips_by_identity() -> anyhow::Result<()> {
    init_tracing();
    let link = connected_pair().await?;
    let root = RootProxy::over(&link.client)?;

    let obj: Arc<dyn ShareableObject> = Arc::new(Counter::new());
    let returned = root.echo_object(Value::Object(obj.clone())).await?;
    let back = returned
        .into_object()
        .expect("expected our own object back");
    assert_eq!(
        Arc::as_ptr(&back) as *const () as usize,
        Arc::as_ptr(&obj) as *const () as usize,
        "send-then-return must yield the original object"
    );

    // Once the peer's transient proxy drops, its release empties our entry.
    let client = link.client.clone();
    wait_until(move || client.held_object_count() == 1).await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_target_is_access_denied() -> anyhow::Result<()> {
    init_tracing();
    let link = connected_pair().await?;

    let err = link
        .client
        .call_method(ObjectId(9999), MethodId(0), vec![], vec![])
        .await
        .unwrap_err();
    match err {
        RpcError::Remote(remote) => {
            assert_eq!(remote.type_name, "AccessDenied");
            assert!(remote.message.contains("does not hold"), "{}", remote.message);
        }
        other => panic!("expected AccessDenied, got {other:?}"),
    }
    // The connection survives a denied request.
    assert!(link.client.is_connected());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn blocking_forms_work_off_the_runtime() -> anyhow::Result<()> {
    init_tracing();
    let link = connected_pair().await?;
    let root = RootProxy::over(&link.client)?;

    let value = tokio::task::spawn_blocking(move || root.echo_blocking(7)).await??;
    assert_eq!(value, 7);
    Ok(())
}
