//! Unreliable-channel behavior: lossy, ordered for what arrives, and never
//! generating reply traffic.

use tether_core::error::RpcError;
use tether_tests::{connected_pair, init_tracing, RootProxy};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn burst_is_lossy_ordered_and_replyless() -> anyhow::Result<()> {
    init_tracing();
    let link = connected_pair().await?;
    let root = RootProxy::over(&link.client)?;

    const BURST: usize = 500;
    for i in 0..BURST {
        root.update_position(i as f64, 0.0)?;
        // Fire-and-forget: nothing is ever pending for these.
        assert_eq!(link.client.pending_operation_count(), 0);
    }

    tokio::time::sleep(std::time::Duration::from_millis(300)).await;

    let seen = link.server_root.positions();
    assert!(seen.len() <= BURST, "observed more deliveries than sends");
    // Deliveries preserve transmit order.
    for window in seen.windows(2) {
        assert!(
            window[0].0 < window[1].0,
            "out-of-order delivery: {:?}",
            window
        );
    }
    assert_eq!(link.client.pending_operation_count(), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreliable_call_on_disconnected_endpoint_fails_fast() -> anyhow::Result<()> {
    init_tracing();
    let link = connected_pair().await?;
    let root = RootProxy::over(&link.client)?;

    link.client.disconnect();
    let err = root.update_position(1.0, 2.0).unwrap_err();
    assert!(matches!(err, RpcError::Disconnected));
    Ok(())
}
