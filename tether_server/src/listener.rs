//! Accepting side of the protocol.
//!
//! One listener binds TCP and UDP on the same address. Every accepted
//! connection gets a network id (starting at 1; 0 stays the unassigned
//! client-side value), a server-role endpoint sharing the listener's root
//! object, and a routed slot in the datagram demux: client datagrams carry
//! their sender's id as a `u16` little-endian prefix, and the demux strips
//! it and forwards the payload to the matching endpoint.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use bytes::Bytes;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tether_core::channel::MAX_DATAGRAM_LEN;
use tether_core::config::EndpointConfig;
use tether_core::endpoint::Endpoint;
use tether_core::table::IdPool;
use tether_core::wire::NetworkId;

struct EndpointSlot {
    endpoint: Endpoint,
    datagram_tx: mpsc::UnboundedSender<Bytes>,
}

struct ListenerShared {
    tcp: TcpListener,
    udp: Arc<UdpSocket>,
    config: EndpointConfig,
    net_ids: Mutex<IdPool>,
    endpoints: Mutex<HashMap<u16, EndpointSlot>>,
    accepted_tx: mpsc::UnboundedSender<Endpoint>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Accepts connections and wires each one up as an endpoint.
pub struct RpcListener {
    shared: Arc<ListenerShared>,
}

impl RpcListener {
    /// Binds TCP and UDP on `addr` (the UDP socket takes the port the TCP
    /// listener actually got, so `addr` may carry port 0) and starts the
    /// accept and demux loops. Accepted endpoints are handed out on the
    /// returned channel; `config.root` is shared by every connection.
    pub async fn bind(
        addr: SocketAddr,
        config: EndpointConfig,
    ) -> anyhow::Result<(RpcListener, mpsc::UnboundedReceiver<Endpoint>)> {
        let tcp = TcpListener::bind(addr).await.context("tcp bind")?;
        let local = tcp.local_addr().context("tcp local_addr")?;
        let udp = Arc::new(
            UdpSocket::bind(SocketAddr::new(local.ip(), local.port()))
                .await
                .context("udp bind")?,
        );

        let mut net_ids = IdPool::new();
        // Retire id 0: it is the unassigned client-side value.
        let _zero = net_ids.allocate();
        debug_assert_eq!(_zero, Some(0));

        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(ListenerShared {
            tcp,
            udp,
            config,
            net_ids: Mutex::new(net_ids),
            endpoints: Mutex::new(HashMap::new()),
            accepted_tx,
            tasks: Mutex::new(Vec::new()),
        });

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(run_accept(shared.clone())));
        tasks.push(tokio::spawn(run_demux(shared.clone())));
        *shared.tasks.lock().expect("tasks lock poisoned") = tasks;

        info!(%local, "listener bound");
        Ok((RpcListener { shared }, accepted_rx))
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.shared.tcp.local_addr()?)
    }

    pub fn endpoint_count(&self) -> usize {
        self.shared.lock_endpoints().len()
    }

    /// Stops both loops and disconnects every live endpoint.
    pub fn shutdown(&self) {
        for task in self
            .shared
            .tasks
            .lock()
            .expect("tasks lock poisoned")
            .drain(..)
        {
            task.abort();
        }
        let endpoints: Vec<Endpoint> = self
            .shared
            .lock_endpoints()
            .drain()
            .map(|(_, slot)| slot.endpoint)
            .collect();
        for endpoint in endpoints {
            endpoint.disconnect();
        }
        info!("listener shut down");
    }
}

impl ListenerShared {
    fn lock_endpoints(&self) -> std::sync::MutexGuard<'_, HashMap<u16, EndpointSlot>> {
        self.endpoints.lock().expect("endpoints lock poisoned")
    }

    fn allocate_net_id(&self) -> Option<u16> {
        self.net_ids.lock().expect("net-id lock poisoned").allocate()
    }

    fn release_net_id(&self, id: u16) {
        self.net_ids.lock().expect("net-id lock poisoned").release(id);
    }
}

async fn run_accept(shared: Arc<ListenerShared>) {
    loop {
        match shared.tcp.accept().await {
            Ok((stream, peer)) => {
                let Some(net_id) = shared.allocate_net_id() else {
                    warn!(%peer, "network ids exhausted, rejecting connection");
                    continue;
                };
                let shared = shared.clone();
                tokio::spawn(async move {
                    run_connection(shared, stream, peer, net_id).await;
                });
            }
            Err(err) => {
                warn!(error = %err, "accept failed");
                break;
            }
        }
    }
}

async fn run_connection(
    shared: Arc<ListenerShared>,
    stream: tokio::net::TcpStream,
    peer: SocketAddr,
    net_id: u16,
) {
    let (datagram_tx, datagram_rx) = mpsc::unbounded_channel();
    match Endpoint::accept(
        shared.config.clone(),
        stream,
        NetworkId(net_id),
        shared.udp.clone(),
        datagram_rx,
    )
    .await
    {
        Ok(endpoint) => {
            shared.lock_endpoints().insert(
                net_id,
                EndpointSlot {
                    endpoint: endpoint.clone(),
                    datagram_tx,
                },
            );
            let _ = shared.accepted_tx.send(endpoint.clone());
            info!(net_id, %peer, "endpoint connected");

            endpoint.closed().await;
            shared.lock_endpoints().remove(&net_id);
            shared.release_net_id(net_id);
            debug!(net_id, "endpoint slot reclaimed");
        }
        Err(err) => {
            warn!(net_id, %peer, error = %err, "handshake failed");
            shared.release_net_id(net_id);
        }
    }
}

async fn run_demux(shared: Arc<ListenerShared>) {
    let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
    loop {
        match shared.udp.recv_from(&mut buf).await {
            Ok((n, from)) => {
                if n < 2 {
                    debug!(%from, "runt datagram dropped");
                    continue;
                }
                let net_id = u16::from_le_bytes([buf[0], buf[1]]);
                let payload = Bytes::copy_from_slice(&buf[2..n]);
                let tx = shared
                    .lock_endpoints()
                    .get(&net_id)
                    .map(|slot| slot.datagram_tx.clone());
                match tx {
                    Some(tx) => {
                        let _ = tx.send(payload);
                    }
                    None => debug!(net_id, %from, "datagram for unknown endpoint dropped"),
                }
            }
            Err(err) => {
                warn!(error = %err, "datagram receive failed");
                break;
            }
        }
    }
}
