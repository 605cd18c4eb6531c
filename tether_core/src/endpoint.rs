//! The per-connection RPC runtime.
//!
//! An `Endpoint` owns one reliable stream and one unreliable datagram link,
//! the three state tables, and the reader/writer tasks. The protocol is
//! symmetric: both sides are `Endpoint`s; only the handshake distinguishes
//! the connecting side from the accepted side.
//!
//! Locking: `tables` is the master lock for all multi-step table mutation.
//! It is never held across an await point, a socket operation, or a user
//! callback; the serializer hooks take it internally per reference.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use bytes::Bytes;
use tokio::net::{TcpStream, UdpSocket};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::binder::{ProxyBinder, ProxyGrip, ProxyObject, ShareableObject};
use crate::channel::{self, DatagramLink, MAX_DATAGRAM_LEN};
use crate::config::{DisconnectedHook, EndpointConfig, NetworkErrorHook};
use crate::dispatch;
use crate::error::{is_expected_close, RpcError};
use crate::serializer::{RefHooks, Serializer};
use crate::table::Tables;
use crate::value::Value;
use crate::wire::{Message, MethodId, NetworkId, ObjectId, OperationId, PropertyId, ROOT_OBJECT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Connecting,
    Connected,
    Closed,
}

/// Where inbound datagrams come from: the connecting side reads its own
/// connected socket, the accepted side is fed by the listener's demux.
pub enum DatagramIntake {
    Socket(Arc<UdpSocket>),
    Routed(mpsc::UnboundedReceiver<Bytes>),
}

/// One side of a connection. Cheap to clone; all clones address the same
/// connection state.
#[derive(Clone)]
pub struct Endpoint {
    shared: Arc<EndpointShared>,
}

pub(crate) struct EndpointShared {
    pub(crate) root: Arc<dyn ShareableObject>,
    pub(crate) binder: Arc<dyn ProxyBinder>,
    pub(crate) serializer: Arc<dyn Serializer>,
    max_held: usize,
    max_remote: usize,
    scheduler_cfg: Option<Handle>,
    on_network_error: Option<NetworkErrorHook>,
    on_disconnected: Option<DisconnectedHook>,
    self_weak: Weak<EndpointShared>,

    phase: Mutex<Phase>,
    connected: AtomicBool,
    net_id: AtomicU16,
    tables: Mutex<Tables>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    datagram: Mutex<Option<DatagramLink>>,
    scheduler: Mutex<Option<Handle>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    peer_root: Mutex<Option<Arc<dyn ProxyObject>>>,
    closed_tx: watch::Sender<bool>,
}

/// Completion future of one outstanding request. The request is already on
/// the wire when this exists; waiting can happen in async or blocking form.
pub struct PendingReply {
    rx: oneshot::Receiver<Result<Value, RpcError>>,
}

impl PendingReply {
    pub async fn wait(self) -> Result<Value, RpcError> {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(RpcError::Disconnected),
        }
    }

    /// Blocking twin of [`wait`](Self::wait). Must not be called from an
    /// async context.
    pub fn wait_blocking(self) -> Result<Value, RpcError> {
        match self.rx.blocking_recv() {
            Ok(outcome) => outcome,
            Err(_) => Err(RpcError::Disconnected),
        }
    }
}

impl Endpoint {
    /// A fresh, unconnected endpoint.
    pub fn new(config: EndpointConfig) -> Self {
        let EndpointConfig {
            root,
            binder,
            serializer,
            max_held_objects,
            max_remote_objects,
            scheduler,
            on_network_error,
            on_disconnected,
        } = config;
        let (closed_tx, _) = watch::channel(false);
        let shared = Arc::new_cyclic(|self_weak| EndpointShared {
            root,
            binder,
            serializer,
            max_held: max_held_objects,
            max_remote: max_remote_objects,
            scheduler_cfg: scheduler,
            on_network_error,
            on_disconnected,
            self_weak: self_weak.clone(),
            phase: Mutex::new(Phase::Idle),
            connected: AtomicBool::new(false),
            net_id: AtomicU16::new(0),
            tables: Mutex::new(Tables::default()),
            outbound: Mutex::new(None),
            datagram: Mutex::new(None),
            scheduler: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            peer_root: Mutex::new(None),
            closed_tx,
        });
        Endpoint { shared }
    }

    pub(crate) fn from_shared(shared: Arc<EndpointShared>) -> Self {
        Endpoint { shared }
    }

    /// Connects to a listener and performs the client-side handshake.
    /// `"localhost"` maps to `127.0.0.1`. Fails with `InUse` if this
    /// endpoint was ever connected before: endpoints are single-shot.
    pub async fn connect(&self, host: &str, port: u16) -> Result<(), RpcError> {
        self.shared.begin_connect()?;
        match self.connect_inner(host, port).await {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(error = %err, "connect failed");
                self.shared.teardown(None);
                Err(err)
            }
        }
    }

    /// Blocking twin of [`connect`](Self::connect); requires a scheduler
    /// handle in the config and must be called off the runtime.
    pub fn connect_blocking(&self, host: &str, port: u16) -> Result<(), RpcError> {
        let handle = self.shared.scheduler_cfg.clone().ok_or_else(|| {
            RpcError::Protocol("connect_blocking requires a scheduler handle in the config".into())
        })?;
        handle.block_on(self.connect(host, port))
    }

    async fn connect_inner(&self, host: &str, port: u16) -> Result<(), RpcError> {
        let shared = &self.shared;
        let ip = resolve_host(host)?;
        let mut stream = TcpStream::connect((ip, port)).await?;
        stream.set_nodelay(true)?;

        // The listener speaks first: our assigned network id.
        let net_id = NetworkId(channel::read_u16(&mut stream).await?);
        shared.net_id.store(net_id.0, Ordering::Relaxed);
        shared.install_root()?;

        let peer_ip = stream.peer_addr()?.ip();
        let bind_ip: IpAddr = match peer_ip {
            IpAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
            IpAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
        };
        let udp = Arc::new(UdpSocket::bind((bind_ip, 0)).await?);

        channel::write_name(&mut stream, shared.root.interface()).await?;
        channel::write_u16(&mut stream, udp.local_addr()?.port()).await?;

        let peer_iface = channel::read_name(&mut stream).await?;
        let peer_port = channel::read_u16(&mut stream).await?;
        let unreliable_peer =
            SocketAddr::new(channel::normalize_peer_ip(bind_ip, peer_ip), peer_port);
        udp.connect(unreliable_peer).await?;

        let peer_root = shared.resolve_or_build_proxy(ROOT_OBJECT, &peer_iface)?;
        *shared.lock_peer_root() = Some(peer_root);

        shared.start_io(
            stream,
            DatagramLink::Connected {
                socket: udp.clone(),
                net_id,
            },
            DatagramIntake::Socket(udp),
        );
        shared.set_connected();
        info!(net_id = net_id.0, peer = %SocketAddr::new(peer_ip, port), "connected");
        Ok(())
    }

    /// Wraps an accepted connection: the listener allocated `net_id`, owns
    /// the shared UDP socket, and routes this endpoint's datagrams into
    /// `datagrams`. Performs the server-side handshake.
    pub async fn accept(
        config: EndpointConfig,
        stream: TcpStream,
        net_id: NetworkId,
        udp: Arc<UdpSocket>,
        datagrams: mpsc::UnboundedReceiver<Bytes>,
    ) -> Result<Endpoint, RpcError> {
        let endpoint = Endpoint::new(config);
        endpoint.shared.begin_connect()?;
        match endpoint
            .accept_inner(stream, net_id, udp, datagrams)
            .await
        {
            Ok(()) => Ok(endpoint),
            Err(err) => {
                endpoint.shared.teardown(None);
                Err(err)
            }
        }
    }

    async fn accept_inner(
        &self,
        mut stream: TcpStream,
        net_id: NetworkId,
        udp: Arc<UdpSocket>,
        datagrams: mpsc::UnboundedReceiver<Bytes>,
    ) -> Result<(), RpcError> {
        let shared = &self.shared;
        stream.set_nodelay(true)?;

        channel::write_u16(&mut stream, net_id.0).await?;
        shared.net_id.store(net_id.0, Ordering::Relaxed);
        shared.install_root()?;
        channel::write_name(&mut stream, shared.root.interface()).await?;
        channel::write_u16(&mut stream, udp.local_addr()?.port()).await?;

        let peer_iface = channel::read_name(&mut stream).await?;
        let peer_port = channel::read_u16(&mut stream).await?;
        let peer_ip = stream.peer_addr()?.ip();
        let local_ip = udp.local_addr()?.ip();
        let unreliable_peer =
            SocketAddr::new(channel::normalize_peer_ip(local_ip, peer_ip), peer_port);

        let peer_root = shared.resolve_or_build_proxy(ROOT_OBJECT, &peer_iface)?;
        *shared.lock_peer_root() = Some(peer_root);

        shared.start_io(
            stream,
            DatagramLink::Shared {
                socket: udp,
                peer: unreliable_peer,
            },
            DatagramIntake::Routed(datagrams),
        );
        shared.set_connected();
        info!(net_id = net_id.0, %unreliable_peer, "endpoint accepted");
        Ok(())
    }

    /// Idempotent teardown: closes transports, fails every pending
    /// operation exactly once, severs proxies, empties the tables.
    pub fn disconnect(&self) {
        self.shared.teardown(None);
    }

    // ─── Observable properties ───

    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }

    pub fn network_id(&self) -> NetworkId {
        NetworkId(self.shared.net_id.load(Ordering::Relaxed))
    }

    /// The local bootstrap root.
    pub fn local(&self) -> Arc<dyn ShareableObject> {
        self.shared.root.clone()
    }

    /// Proxy for the peer's bootstrap root; `None` before handshake or
    /// after disconnect.
    pub fn server(&self) -> Option<Arc<dyn ProxyObject>> {
        self.shared.lock_peer_root().clone()
    }

    pub fn serializer(&self) -> Arc<dyn Serializer> {
        self.shared.serializer.clone()
    }

    /// Scheduler handle inbound invocation bodies run on; `None` until
    /// connected.
    pub fn task_scheduler(&self) -> Option<Handle> {
        self.shared.scheduler()
    }

    pub fn binder(&self) -> Arc<dyn ProxyBinder> {
        self.shared.binder.clone()
    }

    pub fn max_held_objects(&self) -> usize {
        self.shared.max_held
    }

    pub fn max_remote_objects(&self) -> usize {
        self.shared.max_remote
    }

    pub fn held_object_count(&self) -> usize {
        self.shared.tables().held.len()
    }

    pub fn remote_proxy_count(&self) -> usize {
        self.shared.tables().proxies.distinct()
    }

    pub fn pending_operation_count(&self) -> usize {
        self.shared.tables().pending.len()
    }

    /// Resolves once the endpoint has been torn down.
    pub async fn closed(&self) {
        let mut rx = self.shared.closed_tx.subscribe();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    // ─── Request primitives ───

    pub fn start_call_method(
        &self,
        target: ObjectId,
        method: MethodId,
        generics: Vec<String>,
        args: Vec<Value>,
    ) -> Result<PendingReply, RpcError> {
        self.shared.begin_operation(|operation| Message::CallMethod {
            target,
            method,
            generics,
            args,
            operation,
        })
    }

    pub async fn call_method(
        &self,
        target: ObjectId,
        method: MethodId,
        generics: Vec<String>,
        args: Vec<Value>,
    ) -> Result<Value, RpcError> {
        self.start_call_method(target, method, generics, args)?
            .wait()
            .await
    }

    pub fn call_method_blocking(
        &self,
        target: ObjectId,
        method: MethodId,
        generics: Vec<String>,
        args: Vec<Value>,
    ) -> Result<Value, RpcError> {
        self.start_call_method(target, method, generics, args)?
            .wait_blocking()
    }

    /// Fire-and-forget over the unreliable channel: no operation id, no
    /// reply, transport errors dropped. Embedding shareables in the
    /// arguments is permitted but discouraged: a lost datagram strands the
    /// send-count credit until disconnect.
    pub fn call_method_unreliable(
        &self,
        target: ObjectId,
        method: MethodId,
        generics: Vec<String>,
        args: Vec<Value>,
    ) -> Result<(), RpcError> {
        let shared = &self.shared;
        if !shared.is_connected() {
            return Err(RpcError::Disconnected);
        }
        let msg = Message::CallMethodUnreliable {
            target,
            method,
            generics,
            args,
        };
        let payload = match shared.encode(msg) {
            Ok(payload) => payload,
            Err(err) => {
                if matches!(err, RpcError::Overflow(_)) {
                    shared.fault_local("table cap exceeded while encoding");
                }
                return Err(err);
            }
        };
        let Some(link) = shared.lock_datagram().clone() else {
            // Torn down between the connected check and here; same as lost.
            return Ok(());
        };
        if payload.len() > link.max_payload() {
            debug!(len = payload.len(), "unreliable call exceeds datagram size, dropped");
            return Ok(());
        }
        link.send(&payload);
        Ok(())
    }

    pub fn start_get_property(
        &self,
        target: ObjectId,
        property: PropertyId,
    ) -> Result<PendingReply, RpcError> {
        self.shared.begin_operation(|operation| Message::GetProperty {
            target,
            property,
            operation,
        })
    }

    pub async fn get_property(
        &self,
        target: ObjectId,
        property: PropertyId,
    ) -> Result<Value, RpcError> {
        self.start_get_property(target, property)?.wait().await
    }

    pub fn get_property_blocking(
        &self,
        target: ObjectId,
        property: PropertyId,
    ) -> Result<Value, RpcError> {
        self.start_get_property(target, property)?.wait_blocking()
    }

    pub fn start_set_property(
        &self,
        target: ObjectId,
        property: PropertyId,
        value: Value,
    ) -> Result<PendingReply, RpcError> {
        self.shared.begin_operation(|operation| Message::SetProperty {
            target,
            property,
            value,
            operation,
        })
    }

    /// Awaits confirmation: peer-side setter exceptions surface here.
    pub async fn set_property(
        &self,
        target: ObjectId,
        property: PropertyId,
        value: Value,
    ) -> Result<(), RpcError> {
        self.start_set_property(target, property, value)?
            .wait()
            .await
            .map(|_| ())
    }

    pub fn set_property_blocking(
        &self,
        target: ObjectId,
        property: PropertyId,
        value: Value,
    ) -> Result<(), RpcError> {
        self.start_set_property(target, property, value)?
            .wait_blocking()
            .map(|_| ())
    }

    pub fn start_get_indexer(
        &self,
        target: ObjectId,
        property: PropertyId,
        index: Vec<Value>,
    ) -> Result<PendingReply, RpcError> {
        self.shared.begin_operation(|operation| Message::GetIndexer {
            target,
            property,
            index,
            operation,
        })
    }

    pub async fn get_indexer(
        &self,
        target: ObjectId,
        property: PropertyId,
        index: Vec<Value>,
    ) -> Result<Value, RpcError> {
        self.start_get_indexer(target, property, index)?.wait().await
    }

    pub fn get_indexer_blocking(
        &self,
        target: ObjectId,
        property: PropertyId,
        index: Vec<Value>,
    ) -> Result<Value, RpcError> {
        self.start_get_indexer(target, property, index)?.wait_blocking()
    }

    pub fn start_set_indexer(
        &self,
        target: ObjectId,
        property: PropertyId,
        value: Value,
        index: Vec<Value>,
    ) -> Result<PendingReply, RpcError> {
        self.shared.begin_operation(|operation| Message::SetIndexer {
            target,
            property,
            value,
            index,
            operation,
        })
    }

    pub async fn set_indexer(
        &self,
        target: ObjectId,
        property: PropertyId,
        value: Value,
        index: Vec<Value>,
    ) -> Result<(), RpcError> {
        self.start_set_indexer(target, property, value, index)?
            .wait()
            .await
            .map(|_| ())
    }

    pub fn set_indexer_blocking(
        &self,
        target: ObjectId,
        property: PropertyId,
        value: Value,
        index: Vec<Value>,
    ) -> Result<(), RpcError> {
        self.start_set_indexer(target, property, value, index)?
            .wait_blocking()
            .map(|_| ())
    }
}

impl EndpointShared {
    pub(crate) fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().expect("endpoint tables lock poisoned")
    }

    fn lock_peer_root(&self) -> MutexGuard<'_, Option<Arc<dyn ProxyObject>>> {
        self.peer_root.lock().expect("peer-root lock poisoned")
    }

    fn lock_datagram(&self) -> MutexGuard<'_, Option<DatagramLink>> {
        self.datagram.lock().expect("datagram lock poisoned")
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub(crate) fn public(self: &Arc<Self>) -> Endpoint {
        Endpoint {
            shared: self.clone(),
        }
    }

    pub(crate) fn scheduler(&self) -> Option<Handle> {
        self.scheduler.lock().expect("scheduler lock poisoned").clone()
    }

    fn begin_connect(&self) -> Result<(), RpcError> {
        let mut phase = self.phase.lock().expect("phase lock poisoned");
        if *phase != Phase::Idle {
            return Err(RpcError::InUse);
        }
        *phase = Phase::Connecting;
        Ok(())
    }

    fn set_connected(&self) {
        let mut phase = self.phase.lock().expect("phase lock poisoned");
        // A teardown that raced the handshake wins.
        if *phase == Phase::Connecting {
            *phase = Phase::Connected;
            self.connected.store(true, Ordering::SeqCst);
        }
    }

    fn install_root(&self) -> Result<(), RpcError> {
        let id = self.tables().held.register_for_send(&self.root, self.max_held)?;
        debug_assert_eq!(id, ROOT_OBJECT, "root must take the reserved id");
        Ok(())
    }

    pub(crate) fn encode(&self, msg: Message<Value>) -> Result<Bytes, RpcError> {
        self.serializer.encode(msg, self)
    }

    /// Encodes and enqueues one reliable frame. The writer task emits frames
    /// one at a time, so each (length, payload) pair is atomic on the wire.
    pub(crate) fn send_frame(&self, msg: Message<Value>) -> Result<(), RpcError> {
        let payload = self.encode(msg)?;
        let tx = self
            .outbound
            .lock()
            .expect("outbound lock poisoned")
            .clone()
            .ok_or(RpcError::Disconnected)?;
        tx.send(payload).map_err(|_| RpcError::Disconnected)
    }

    fn begin_operation(
        &self,
        build: impl FnOnce(OperationId) -> Message<Value>,
    ) -> Result<PendingReply, RpcError> {
        if !self.is_connected() {
            return Err(RpcError::Disconnected);
        }
        let (tx, rx) = oneshot::channel();
        let operation = self
            .tables()
            .pending
            .allocate(tx)
            .ok_or(RpcError::Overflow("operation ids exhausted"))?;
        let msg = build(operation);
        match self.send_frame(msg) {
            Ok(()) => Ok(PendingReply { rx }),
            Err(err) => {
                // The reply will never come; free the slot.
                let _ = self.tables().pending.complete(operation);
                if matches!(err, RpcError::Overflow(_)) {
                    self.fault_local("table cap exceeded while encoding");
                }
                Err(err)
            }
        }
    }

    /// Cap or counting faults discovered locally terminate the connection.
    pub(crate) fn fault_local(&self, reason: &str) {
        error!(reason, "fatal protocol condition, terminating connection");
        self.teardown(None);
    }

    pub(crate) fn send_release(&self, count: u64, target: ObjectId) {
        if count == 0 {
            return;
        }
        if let Err(err) = self.send_frame(Message::Release { count, target }) {
            debug!(error = %err, object = target.0, "release not delivered");
        }
    }

    /// Drop half of the lifetime protocol: the grip of a dying proxy calls
    /// in here. Credits the owner unless the slot was already rebuilt.
    pub(crate) fn proxy_dropped(&self, object: ObjectId, generation: u64) {
        let count = self.tables().proxies.drop_instance(object, generation);
        if let Some(count) = count {
            debug!(object = object.0, count, "proxy dropped");
            self.send_release(count, object);
        }
    }

    /// Owner half: a `Release(count)` arrived from the peer.
    pub(crate) fn credit_release(&self, target: ObjectId, count: u64) -> Result<(), RpcError> {
        let removed = self.tables().held.credit_release(target, count)?;
        if removed.is_some() {
            debug!(object = target.0, "held object fully released");
        }
        // Dropped here, outside the master lock: the object may own proxies
        // whose grips take the lock on drop.
        drop(removed);
        Ok(())
    }

    fn start_io(self: &Arc<Self>, stream: TcpStream, link: DatagramLink, intake: DatagramIntake) {
        // Held for the whole (synchronous) setup so a concurrent teardown
        // cannot interleave and orphan freshly spawned tasks.
        let phase = self.phase.lock().expect("phase lock poisoned");
        if *phase != Phase::Connecting {
            debug!("endpoint closed before IO start");
            return;
        }
        let scheduler = self
            .scheduler_cfg
            .clone()
            .unwrap_or_else(Handle::current);
        *self.scheduler.lock().expect("scheduler lock poisoned") = Some(scheduler.clone());

        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        *self.outbound.lock().expect("outbound lock poisoned") = Some(tx);
        *self.lock_datagram() = Some(link);

        let mut tasks = self.tasks.lock().expect("tasks lock poisoned");

        let writer_shared = self.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(err) = channel::run_writer(rx, write_half).await {
                writer_shared.teardown(Some(err));
            }
        }));

        let reader_shared = self.clone();
        tasks.push(tokio::spawn(dispatch::run_reliable_reader(
            reader_shared,
            read_half,
        )));

        // The socket reader only forwards bytes; the executor below is what
        // runs user code, and it drains one datagram at a time so deliveries
        // are observed in transmit order.
        let mut datagram_rx = match intake {
            DatagramIntake::Socket(socket) => {
                let (tx, rx) = mpsc::unbounded_channel();
                tasks.push(tokio::spawn(async move {
                    let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
                    loop {
                        match socket.recv(&mut buf).await {
                            Ok(n) => {
                                if tx.send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                                    break;
                                }
                            }
                            Err(err) => {
                                debug!(error = %err, "unreliable receive loop ended");
                                break;
                            }
                        }
                    }
                }));
                rx
            }
            DatagramIntake::Routed(rx) => rx,
        };
        let unreliable_shared = self.clone();
        tasks.push(scheduler.spawn(async move {
            while let Some(datagram) = datagram_rx.recv().await {
                dispatch::run_unreliable(&unreliable_shared, &datagram).await;
            }
        }));
    }

    /// Idempotent teardown. The first caller wins; everyone else returns
    /// immediately. Observers run at most once, gated on whether the
    /// endpoint had reached Connected.
    pub(crate) fn teardown(&self, cause: Option<io::Error>) {
        let was_connected = {
            let mut phase = self.phase.lock().expect("phase lock poisoned");
            if *phase == Phase::Closed {
                return;
            }
            let was = *phase == Phase::Connected;
            *phase = Phase::Closed;
            was
        };
        self.connected.store(false, Ordering::SeqCst);

        // Dropping the queue ends the writer; readers are cancelled.
        drop(self.outbound.lock().expect("outbound lock poisoned").take());
        drop(self.lock_datagram().take());
        for task in self.tasks.lock().expect("tasks lock poisoned").drain(..) {
            task.abort();
        }

        let (waiters, held_objects) = {
            let mut tables = self.tables();
            let waiters = tables.pending.drain();
            let held_objects = tables.held.drain_objects();
            tables.proxies.clear();
            (waiters, held_objects)
        };
        for tx in waiters {
            let _ = tx.send(Err(RpcError::disconnected_io()));
        }
        // Held objects may own proxies whose grips take the master lock on
        // drop; release them only after the lock is free.
        drop(held_objects);
        *self.lock_peer_root() = None;
        *self.scheduler.lock().expect("scheduler lock poisoned") = None;

        if was_connected {
            match &cause {
                Some(err) if !is_expected_close(err) => {
                    warn!(error = %err, "endpoint failed");
                    if let Some(hook) = &self.on_network_error {
                        hook(err);
                    }
                }
                Some(err) => debug!(error = %err, "peer closed the connection"),
                None => {}
            }
            if let Some(hook) = &self.on_disconnected {
                hook();
            }
            info!("endpoint disconnected");
        }
        let _ = self.closed_tx.send(true);
    }
}

impl RefHooks for EndpointShared {
    fn register_local_for_send(
        &self,
        obj: &Arc<dyn ShareableObject>,
    ) -> Result<ObjectId, RpcError> {
        self.tables().held.register_for_send(obj, self.max_held)
    }

    fn resolve_or_build_proxy(
        &self,
        object: ObjectId,
        iface: &str,
    ) -> Result<Arc<dyn ProxyObject>, RpcError> {
        let (stranded, generation) = {
            let mut tables = self.tables();
            if let Some(proxy) = tables.proxies.resolve_live(object) {
                return Ok(proxy);
            }
            let stranded = tables.proxies.take_expired(object);
            if stranded.is_none() && tables.proxies.distinct() >= self.max_remote {
                return Err(RpcError::Overflow("remote-proxy table is full"));
            }
            (stranded, tables.proxies.next_generation())
        };

        // The binder runs outside the master lock: a failed build drops the
        // grip, and grip drops take that lock themselves.
        let grip = ProxyGrip::new(
            self.self_weak.clone(),
            object,
            iface.to_string(),
            generation,
        );
        let outcome = match self.binder.remote_proxy(iface, grip) {
            Ok(proxy) => {
                let mut tables = self.tables();
                // Another decoder may have rebuilt the slot while the binder
                // ran; first install wins so at most one proxy stays live.
                if let Some(existing) = tables.proxies.resolve_live(object) {
                    drop(tables);
                    drop(proxy);
                    Ok(existing)
                } else {
                    tables.proxies.install(object, Arc::downgrade(&proxy), generation);
                    Ok(proxy)
                }
            }
            Err(err) => Err(err),
        };

        // The dying instance's drop finds a newer generation and backs off;
        // its occurrences are credited here whether or not the rebuild
        // succeeded, so a failed build cannot strand the owner's count.
        if let Some(count) = stranded {
            self.send_release(count, object);
        }
        outcome
    }

    fn retrieve_local(&self, object: ObjectId) -> Option<Arc<dyn ShareableObject>> {
        self.tables().held.get(object)
    }

    fn proxy_send_ref(&self, proxy: &Arc<dyn ProxyObject>) -> Result<ObjectId, RpcError> {
        let grip = proxy.grip();
        if !grip.belongs_to(self) {
            return Err(RpcError::Protocol(
                "proxy belongs to a different endpoint".into(),
            ));
        }
        Ok(grip.object())
    }
}

fn resolve_host(host: &str) -> Result<IpAddr, RpcError> {
    if host.eq_ignore_ascii_case("localhost") {
        return Ok(IpAddr::V4(Ipv4Addr::LOCALHOST));
    }
    host.parse().map_err(|_| {
        RpcError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unparseable host address {host:?}"),
        ))
    })
}
