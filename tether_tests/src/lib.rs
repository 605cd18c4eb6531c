//! Test fixtures for the tether crates.
//!
//! A hand-written stand-in for a generated proxy binder: concrete test
//! services ([`RootService`], [`Counter`], [`KvMap`]), their typed proxies,
//! and the [`FixtureBinder`] that wires both sides together. The proxies
//! forward each member through the endpoint primitives exactly the way
//! binder-generated code would.

use std::any::Any;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc;

use tether_core::binder::{
    LocalData, ProxyBinder, ProxyGrip, ProxyObject, ShareableObject,
};
use tether_core::config::EndpointConfig;
use tether_core::endpoint::Endpoint;
use tether_core::error::{InvokeError, RpcError};
use tether_core::value::Value;
use tether_core::wire::{MethodId, PropertyId};
use tether_server::RpcListener;

pub const ROOT_IFACE: &str = "tether.tests.RootService";
pub const COUNTER_IFACE: &str = "tether.tests.Counter";
pub const KV_MAP_IFACE: &str = "tether.tests.KvMap";

// ─── Local services ───

/// Root service both sides expose at handshake.
#[derive(Default)]
pub struct RootService {
    greeting: Mutex<String>,
    positions: Mutex<Vec<(f64, f64)>>,
    shared_counter: Mutex<Option<Arc<Counter>>>,
}

impl RootService {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Positions recorded by `update_position`, in arrival order.
    pub fn positions(&self) -> Vec<(f64, f64)> {
        self.positions.lock().unwrap().clone()
    }

    pub fn greeting(&self) -> String {
        self.greeting.lock().unwrap().clone()
    }

    pub fn set_greeting(&self, value: &str) {
        *self.greeting.lock().unwrap() = value.to_string();
    }
}

impl ShareableObject for RootService {
    fn interface(&self) -> &'static str {
        ROOT_IFACE
    }
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[derive(Default)]
pub struct Counter {
    value: AtomicI64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ShareableObject for Counter {
    fn interface(&self) -> &'static str {
        COUNTER_IFACE
    }
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[derive(Default)]
pub struct KvMap {
    entries: Mutex<HashMap<String, String>>,
}

impl ShareableObject for KvMap {
    fn interface(&self) -> &'static str {
        KV_MAP_IFACE
    }
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

// ─── Invocation helpers ───

fn cast<T: Send + Sync + 'static>(
    target: Arc<dyn ShareableObject>,
) -> Result<Arc<T>, InvokeError> {
    target
        .as_any()
        .downcast::<T>()
        .map_err(|_| InvokeError::new("InvalidCast", "target has the wrong runtime type"))
}

fn int_arg(args: &[Value], index: usize) -> Result<i64, InvokeError> {
    args.get(index)
        .and_then(Value::as_i64)
        .ok_or_else(|| InvokeError::new("ArgumentError", format!("argument {index} must be an integer")))
}

fn float_arg(args: &[Value], index: usize) -> Result<f64, InvokeError> {
    args.get(index)
        .and_then(Value::as_f64)
        .ok_or_else(|| InvokeError::new("ArgumentError", format!("argument {index} must be a number")))
}

fn str_arg(args: &[Value], index: usize) -> Result<String, InvokeError> {
    args.get(index)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| InvokeError::new("ArgumentError", format!("argument {index} must be a string")))
}

// ─── Dispatch tables ───

fn root_data() -> Arc<LocalData> {
    Arc::new(
        LocalData::new()
            .method(0, "echo", |call| {
                Box::pin(async move {
                    let v = int_arg(&call.args, 0)?;
                    Ok(Value::Int(v))
                })
            })
            .method(1, "new_counter", |_call| {
                Box::pin(async move {
                    Ok(Value::Object(
                        Arc::new(Counter::new()) as Arc<dyn ShareableObject>
                    ))
                })
            })
            .method(2, "slow_echo", |call| {
                Box::pin(async move {
                    let v = int_arg(&call.args, 0)?;
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok(Value::Int(v))
                })
            })
            .method(3, "update_position", |call| {
                Box::pin(async move {
                    let x = float_arg(&call.args, 0)?;
                    let y = float_arg(&call.args, 1)?;
                    let root = cast::<RootService>(call.target)?;
                    root.positions.lock().unwrap().push((x, y));
                    Ok(Value::Null)
                })
            })
            .method(4, "new_map", |_call| {
                Box::pin(async move {
                    Ok(Value::Object(
                        Arc::new(KvMap::default()) as Arc<dyn ShareableObject>
                    ))
                })
            })
            .method(5, "echo_object", |call| {
                Box::pin(async move {
                    call.args
                        .into_iter()
                        .next()
                        .ok_or_else(|| InvokeError::new("ArgumentError", "missing argument 0"))
                })
            })
            .method(6, "shared_counter", |call| {
                Box::pin(async move {
                    let root = cast::<RootService>(call.target)?;
                    let counter = root
                        .shared_counter
                        .lock()
                        .unwrap()
                        .get_or_insert_with(|| Arc::new(Counter::new()))
                        .clone();
                    Ok(Value::Object(counter as Arc<dyn ShareableObject>))
                })
            })
            .method(7, "mirror_greeting", |call| {
                Box::pin(async move {
                    // Calls back into the caller's root mid-invocation.
                    let peer = call
                        .endpoint
                        .server()
                        .ok_or_else(|| InvokeError::new("Disconnected", "no peer root"))?;
                    let peer = peer.as_any().downcast::<RootProxy>().map_err(|_| {
                        InvokeError::new("InvalidCast", "peer root is not a RootService proxy")
                    })?;
                    let greeting = peer
                        .greeting()
                        .await
                        .map_err(|err| InvokeError::new("NestedCallFailed", err.to_string()))?;
                    Ok(Value::Str(greeting))
                })
            })
            .getter(0, "greeting", |get| {
                let root = cast::<RootService>(get.target)?;
                let s = root.greeting.lock().unwrap().clone();
                Ok(Value::Str(s))
            })
            .setter(0, "greeting", |set| {
                let root = cast::<RootService>(set.target)?;
                let s = set
                    .value
                    .as_str()
                    .ok_or_else(|| InvokeError::new("ArgumentError", "greeting must be a string"))?;
                *root.greeting.lock().unwrap() = s.to_string();
                Ok(())
            }),
    )
}

fn counter_data() -> Arc<LocalData> {
    Arc::new(LocalData::new().method(0, "increment", |call| {
        Box::pin(async move {
            let counter = cast::<Counter>(call.target)?;
            Ok(Value::Int(counter.value.fetch_add(1, Ordering::SeqCst) + 1))
        })
    }))
}

fn kv_map_data() -> Arc<LocalData> {
    Arc::new(
        LocalData::new()
            .getter(0, "item", |get| {
                let key = str_arg(&get.index, 0)?;
                let map = cast::<KvMap>(get.target)?;
                let entries = map.entries.lock().unwrap();
                entries
                    .get(&key)
                    .cloned()
                    .map(Value::Str)
                    .ok_or_else(|| {
                        InvokeError::new("KeyNotFound", format!("no entry for key {key:?}"))
                    })
            })
            .setter(0, "item", |set| {
                let key = str_arg(&set.index, 0)?;
                let value = set
                    .value
                    .as_str()
                    .ok_or_else(|| InvokeError::new("ArgumentError", "value must be a string"))?
                    .to_string();
                let map = cast::<KvMap>(set.target)?;
                map.entries.lock().unwrap().insert(key, value);
                Ok(())
            }),
    )
}

// ─── The binder ───

/// Hand-written binder over the three test interfaces.
pub struct FixtureBinder {
    tables: HashMap<&'static str, Arc<LocalData>>,
}

impl FixtureBinder {
    pub fn new() -> Arc<Self> {
        let mut tables = HashMap::new();
        tables.insert(ROOT_IFACE, root_data());
        tables.insert(COUNTER_IFACE, counter_data());
        tables.insert(KV_MAP_IFACE, kv_map_data());
        Arc::new(Self { tables })
    }
}

impl ProxyBinder for FixtureBinder {
    fn remote_proxy(
        &self,
        iface: &str,
        grip: ProxyGrip,
    ) -> Result<Arc<dyn ProxyObject>, RpcError> {
        match iface {
            ROOT_IFACE => Ok(Arc::new(RootProxy { grip })),
            COUNTER_IFACE => Ok(Arc::new(CounterProxy { grip })),
            KV_MAP_IFACE => Ok(Arc::new(KvMapProxy { grip })),
            other => Err(RpcError::Protocol(format!(
                "unknown shared interface {other:?}"
            ))),
        }
    }

    fn local_data(&self, iface: &str) -> Option<Arc<LocalData>> {
        self.tables.get(iface).cloned()
    }
}

// ─── Typed proxies ───

pub struct RootProxy {
    grip: ProxyGrip,
}

impl ProxyObject for RootProxy {
    fn grip(&self) -> &ProxyGrip {
        &self.grip
    }
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl RootProxy {
    /// The peer root of a connected endpoint, typed.
    pub fn over(endpoint: &Endpoint) -> anyhow::Result<Arc<RootProxy>> {
        let proxy = endpoint.server().context("endpoint has no peer root")?;
        proxy
            .as_any()
            .downcast::<RootProxy>()
            .map_err(|_| anyhow::anyhow!("peer root is not a RootService proxy"))
    }

    pub async fn echo(&self, v: i64) -> Result<i64, RpcError> {
        let out = self
            .grip
            .endpoint()?
            .call_method(self.grip.object(), MethodId(0), vec![], vec![Value::Int(v)])
            .await?;
        out.as_i64()
            .ok_or_else(|| RpcError::Protocol("echo returned a non-integer".into()))
    }

    /// Blocking twin of [`echo`](Self::echo); must be called off the runtime.
    pub fn echo_blocking(&self, v: i64) -> Result<i64, RpcError> {
        let out = self.grip.endpoint()?.call_method_blocking(
            self.grip.object(),
            MethodId(0),
            vec![],
            vec![Value::Int(v)],
        )?;
        out.as_i64()
            .ok_or_else(|| RpcError::Protocol("echo returned a non-integer".into()))
    }

    pub async fn new_counter(&self) -> Result<Arc<CounterProxy>, RpcError> {
        let out = self
            .grip
            .endpoint()?
            .call_method(self.grip.object(), MethodId(1), vec![], vec![])
            .await?;
        downcast_proxy(out, "new_counter")
    }

    pub async fn slow_echo(&self, v: i64) -> Result<i64, RpcError> {
        let out = self
            .grip
            .endpoint()?
            .call_method(self.grip.object(), MethodId(2), vec![], vec![Value::Int(v)])
            .await?;
        out.as_i64()
            .ok_or_else(|| RpcError::Protocol("slow_echo returned a non-integer".into()))
    }

    /// Fire-and-forget position update over the unreliable channel.
    pub fn update_position(&self, x: f64, y: f64) -> Result<(), RpcError> {
        self.grip.endpoint()?.call_method_unreliable(
            self.grip.object(),
            MethodId(3),
            vec![],
            vec![Value::Float(x), Value::Float(y)],
        )
    }

    pub async fn new_map(&self) -> Result<Arc<KvMapProxy>, RpcError> {
        let out = self
            .grip
            .endpoint()?
            .call_method(self.grip.object(), MethodId(4), vec![], vec![])
            .await?;
        downcast_proxy(out, "new_map")
    }

    /// Returns the argument unchanged; exercises reference round-trips.
    pub async fn echo_object(&self, value: Value) -> Result<Value, RpcError> {
        self.grip
            .endpoint()?
            .call_method(self.grip.object(), MethodId(5), vec![], vec![value])
            .await
    }

    /// Asks the peer to read our own greeting back to us.
    pub async fn mirror_greeting(&self) -> Result<String, RpcError> {
        let out = self
            .grip
            .endpoint()?
            .call_method(self.grip.object(), MethodId(7), vec![], vec![])
            .await?;
        out.as_str()
            .map(str::to_string)
            .ok_or_else(|| RpcError::Protocol("mirror_greeting returned a non-string".into()))
    }

    /// The per-root counter instance, created on first call.
    pub async fn shared_counter(&self) -> Result<Arc<CounterProxy>, RpcError> {
        let out = self
            .grip
            .endpoint()?
            .call_method(self.grip.object(), MethodId(6), vec![], vec![])
            .await?;
        downcast_proxy(out, "shared_counter")
    }

    pub async fn greeting(&self) -> Result<String, RpcError> {
        let out = self
            .grip
            .endpoint()?
            .get_property(self.grip.object(), PropertyId(0))
            .await?;
        out.as_str()
            .map(str::to_string)
            .ok_or_else(|| RpcError::Protocol("greeting is not a string".into()))
    }

    pub async fn set_greeting(&self, value: &str) -> Result<(), RpcError> {
        self.grip
            .endpoint()?
            .set_property(self.grip.object(), PropertyId(0), Value::from(value))
            .await
    }
}

pub struct CounterProxy {
    grip: ProxyGrip,
}

impl ProxyObject for CounterProxy {
    fn grip(&self) -> &ProxyGrip {
        &self.grip
    }
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl CounterProxy {
    pub async fn increment(&self) -> Result<i64, RpcError> {
        let out = self
            .grip
            .endpoint()?
            .call_method(self.grip.object(), MethodId(0), vec![], vec![])
            .await?;
        out.as_i64()
            .ok_or_else(|| RpcError::Protocol("increment returned a non-integer".into()))
    }
}

pub struct KvMapProxy {
    grip: ProxyGrip,
}

impl ProxyObject for KvMapProxy {
    fn grip(&self) -> &ProxyGrip {
        &self.grip
    }
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

impl KvMapProxy {
    pub async fn get(&self, key: &str) -> Result<String, RpcError> {
        let out = self
            .grip
            .endpoint()?
            .get_indexer(self.grip.object(), PropertyId(0), vec![Value::from(key)])
            .await?;
        out.as_str()
            .map(str::to_string)
            .ok_or_else(|| RpcError::Protocol("indexer returned a non-string".into()))
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<(), RpcError> {
        self.grip
            .endpoint()?
            .set_indexer(
                self.grip.object(),
                PropertyId(0),
                Value::from(value),
                vec![Value::from(key)],
            )
            .await
    }
}

fn downcast_proxy<T: ProxyObject>(out: Value, what: &str) -> Result<Arc<T>, RpcError> {
    let proxy = out
        .into_proxy()
        .ok_or_else(|| RpcError::Protocol(format!("{what} did not return a reference")))?;
    proxy
        .as_any()
        .downcast::<T>()
        .map_err(|_| RpcError::Protocol(format!("{what} returned the wrong proxy type")))
}

// ─── Harness ───

/// A listener, its first accepted endpoint, and the client that dialed in.
pub struct TestLink {
    pub listener: RpcListener,
    pub client: Endpoint,
    pub server: Endpoint,
    pub server_root: Arc<RootService>,
    pub client_root: Arc<RootService>,
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_test_writer()
        .try_init();
}

pub async fn connected_pair() -> anyhow::Result<TestLink> {
    connected_pair_with(|cfg| cfg, |cfg| cfg).await
}

/// Same as [`connected_pair`], with config hooks for each side.
pub async fn connected_pair_with(
    server_cfg: impl FnOnce(EndpointConfig) -> EndpointConfig,
    client_cfg: impl FnOnce(EndpointConfig) -> EndpointConfig,
) -> anyhow::Result<TestLink> {
    let binder = FixtureBinder::new();
    let server_root = RootService::new();
    let client_root = RootService::new();

    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
    let (listener, accepted) = RpcListener::bind(
        addr,
        server_cfg(EndpointConfig::new(server_root.clone(), binder.clone())),
    )
    .await?;
    let local = listener.local_addr()?;

    let client = Endpoint::new(client_cfg(EndpointConfig::new(
        client_root.clone(),
        binder.clone(),
    )));
    client.connect(&local.ip().to_string(), local.port()).await?;

    let server = recv_accepted(accepted).await?;
    Ok(TestLink {
        listener,
        client,
        server,
        server_root,
        client_root,
    })
}

async fn recv_accepted(
    mut accepted: mpsc::UnboundedReceiver<Endpoint>,
) -> anyhow::Result<Endpoint> {
    tokio::time::timeout(Duration::from_secs(5), accepted.recv())
        .await
        .context("timed out waiting for the accepted endpoint")?
        .context("listener dropped the accepted channel")
}

/// Polls `cond` until it holds or two seconds pass.
pub async fn wait_until(mut cond: impl FnMut() -> bool) -> anyhow::Result<()> {
    for _ in 0..200 {
        if cond() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    anyhow::bail!("condition not reached within 2s")
}
