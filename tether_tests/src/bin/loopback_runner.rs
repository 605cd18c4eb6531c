//! Loopback demo: a listener and a client in one process, walking one of
//! each accessor kind and logging the exchange.

use anyhow::Context;
use tracing::info;

use tether_core::value::Value;
use tether_tests::{connected_pair, RootProxy};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let link = connected_pair().await.context("loopback pair")?;
    info!(
        net_id = link.client.network_id().0,
        "client and server endpoint connected"
    );

    let root = RootProxy::over(&link.client)?;

    let echoed = root.echo(42).await?;
    info!(echoed, "method call");

    root.set_greeting("hello from the loopback runner").await?;
    let greeting = root.greeting().await?;
    info!(%greeting, "property round trip");

    let map = root.new_map().await?;
    map.set("color", "teal").await?;
    let color = map.get("color").await?;
    info!(%color, "indexer round trip");

    let counter = root.new_counter().await?;
    info!(value = counter.increment().await?, "counter increment");
    info!(value = counter.increment().await?, "counter increment");

    for i in 0..16 {
        root.update_position(i as f64, -(i as f64))?;
    }
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    info!(
        delivered = link.server_root.positions().len(),
        "unreliable burst observed by the server"
    );

    let returned = root.echo_object(Value::from("identity")).await?;
    info!(?returned, "echoed value");

    drop(counter);
    drop(map);
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    info!(
        held = link.server.held_object_count(),
        "server held objects after proxy drops"
    );

    link.client.disconnect();
    link.listener.shutdown();
    info!("loopback run complete");
    Ok(())
}
