//! Disconnection semantics: pending operations fail exactly once, later
//! calls fail fast, teardown is idempotent, and cap overflows terminate the
//! connection.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tether_core::binder::ShareableObject;
use tether_core::error::RpcError;
use tether_core::value::Value;
use tether_tests::{connected_pair, connected_pair_with, init_tracing, wait_until, Counter, RootProxy};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn peer_death_mid_call_fails_the_pending_operation() -> anyhow::Result<()> {
    init_tracing();
    let link = connected_pair().await?;
    let root = RootProxy::over(&link.client)?;

    let call = tokio::spawn({
        let root = root.clone();
        async move { root.slow_echo(5).await }
    });
    tokio::time::sleep(Duration::from_millis(200)).await;

    // The peer goes away while our call is in flight.
    link.server.disconnect();

    let result = call.await?;
    assert!(
        matches!(result, Err(RpcError::Io(_))),
        "expected an IO failure, got {result:?}"
    );

    // Later calls fail immediately, without touching the wire.
    let client = link.client.clone();
    wait_until(move || !client.is_connected()).await?;
    let err = root.echo(1).await.unwrap_err();
    assert!(matches!(err, RpcError::Disconnected));
    assert_eq!(link.client.pending_operation_count(), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn every_pending_operation_completes_exactly_once() -> anyhow::Result<()> {
    init_tracing();
    let link = connected_pair().await?;
    let root = RootProxy::over(&link.client)?;

    let mut calls = Vec::new();
    for i in 0..8 {
        let root = root.clone();
        calls.push(tokio::spawn(async move { root.slow_echo(i).await }));
    }
    let client = link.client.clone();
    wait_until(move || client.pending_operation_count() == 8).await?;

    link.client.disconnect();

    for call in calls {
        let result = call.await?;
        assert!(
            matches!(result, Err(RpcError::Io(_))),
            "expected an IO failure, got {result:?}"
        );
    }
    assert_eq!(link.client.pending_operation_count(), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn teardown_is_idempotent_and_observers_fire_once() -> anyhow::Result<()> {
    init_tracing();
    let disconnects = Arc::new(AtomicUsize::new(0));
    let hook_count = disconnects.clone();
    let link = connected_pair_with(
        |cfg| cfg,
        move |mut cfg| {
            let hook_count = hook_count.clone();
            cfg.on_disconnected = Some(Arc::new(move || {
                hook_count.fetch_add(1, Ordering::SeqCst);
            }));
            cfg
        },
    )
    .await?;

    link.client.disconnect();
    link.client.disconnect();
    link.client.disconnect();
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);

    // Endpoints are single-shot: reconnecting is a fresh endpoint's job.
    let err = link.client.connect("localhost", 1).await.unwrap_err();
    assert!(matches!(err, RpcError::InUse));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn proxies_are_severed_by_teardown() -> anyhow::Result<()> {
    init_tracing();
    let link = connected_pair().await?;
    let root = RootProxy::over(&link.client)?;
    let counter = root.new_counter().await?;

    link.client.disconnect();

    let err = counter.increment().await.unwrap_err();
    assert!(matches!(err, RpcError::Disconnected));
    assert!(link.client.server().is_none());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn held_cap_overflow_fails_the_call_and_terminates() -> anyhow::Result<()> {
    init_tracing();
    let link = connected_pair_with(
        |cfg| cfg,
        |mut cfg| {
            cfg.max_held_objects = 2;
            cfg
        },
    )
    .await?;
    let root = RootProxy::over(&link.client)?;

    // Root occupies one slot; two fresh objects in one payload burst the cap
    // mid-encode.
    let a: Arc<dyn ShareableObject> = Arc::new(Counter::new());
    let b: Arc<dyn ShareableObject> = Arc::new(Counter::new());
    let err = root
        .echo_object(Value::List(vec![Value::Object(a), Value::Object(b)]))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Overflow(_)), "got {err:?}");
    assert!(!link.client.is_connected());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn remote_cap_overflow_terminates() -> anyhow::Result<()> {
    init_tracing();
    let link = connected_pair_with(
        |cfg| cfg,
        |mut cfg| {
            cfg.max_remote_objects = 2;
            cfg
        },
    )
    .await?;
    let root = RootProxy::over(&link.client)?;

    // The peer root takes one slot, the first counter the second; keeping it
    // alive forces the next distinct inbound reference over the cap.
    let first = root.new_counter().await?;
    let second = root.new_counter().await;
    assert!(second.is_err(), "expected the overflowing call to fail");

    let client = link.client.clone();
    wait_until(move || !client.is_connected()).await?;
    drop(first);
    Ok(())
}
