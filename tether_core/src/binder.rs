//! The proxy-binder seam.
//!
//! The engine does not know concrete proxy types or how to dispatch into
//! concrete local objects; a [`ProxyBinder`] supplies both. For a shared
//! interface name it can build a proxy instance (receiver side) and produce
//! the dispatch tables that map member ids to invokables (owner side). A
//! generated binder and a hand-written one look the same from here.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};

use crate::endpoint::{Endpoint, EndpointShared};
use crate::error::{InvokeError, RpcError};
use crate::value::Value;
use crate::wire::{MethodId, ObjectId, PropertyId};

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// A local object whose instances cross the wire by reference.
pub trait ShareableObject: Any + Send + Sync {
    /// Serializer-stable name of the shared interface this object implements.
    fn interface(&self) -> &'static str;
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Receiver-side stand-in for a peer-owned object. Concrete proxy types
/// embed a [`ProxyGrip`] and forward their members through the endpoint's
/// request primitives.
pub trait ProxyObject: Any + Send + Sync {
    fn grip(&self) -> &ProxyGrip;
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Engine-owned handle embedded in every proxy.
///
/// Dropping the last strong reference to a proxy drops its grip, which
/// credits the owner through the release protocol. The generation ties the
/// grip to one proxy-table entry so a rebuilt proxy for the same id cannot
/// be double-credited.
pub struct ProxyGrip {
    endpoint: Weak<EndpointShared>,
    object: ObjectId,
    iface: String,
    generation: u64,
}

impl ProxyGrip {
    pub(crate) fn new(
        endpoint: Weak<EndpointShared>,
        object: ObjectId,
        iface: String,
        generation: u64,
    ) -> Self {
        Self {
            endpoint,
            object,
            iface,
            generation,
        }
    }

    /// Id of the referenced object in the owner's held table.
    pub fn object(&self) -> ObjectId {
        self.object
    }

    /// Shared interface name this proxy was built for.
    pub fn interface(&self) -> &str {
        &self.iface
    }

    /// The endpoint this proxy forwards through. Fails with `Disconnected`
    /// once the endpoint is gone; member access on a severed proxy is a
    /// deterministic error, never a hang.
    pub fn endpoint(&self) -> Result<Endpoint, RpcError> {
        self.endpoint
            .upgrade()
            .map(Endpoint::from_shared)
            .ok_or(RpcError::Disconnected)
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn belongs_to(&self, shared: &EndpointShared) -> bool {
        std::ptr::eq(self.endpoint.as_ptr(), shared as *const EndpointShared)
    }
}

impl fmt::Debug for ProxyGrip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyGrip")
            .field("object", &self.object)
            .field("iface", &self.iface)
            .field("generation", &self.generation)
            .finish()
    }
}

impl Drop for ProxyGrip {
    fn drop(&mut self) {
        if let Some(shared) = self.endpoint.upgrade() {
            shared.proxy_dropped(self.object, self.generation);
        }
    }
}

/// One inbound method invocation, handed to the invokable.
pub struct MethodCall {
    pub endpoint: Endpoint,
    pub target: Arc<dyn ShareableObject>,
    pub args: Vec<Value>,
    pub generics: Vec<String>,
}

/// One inbound property or indexer read. `index` is empty for plain
/// properties.
pub struct PropertyGet {
    pub target: Arc<dyn ShareableObject>,
    pub index: Vec<Value>,
}

/// One inbound property or indexer write.
pub struct PropertySet {
    pub target: Arc<dyn ShareableObject>,
    pub value: Value,
    pub index: Vec<Value>,
}

pub type MethodFn =
    Arc<dyn Fn(MethodCall) -> BoxFuture<Result<Value, InvokeError>> + Send + Sync>;
pub type GetFn = Arc<dyn Fn(PropertyGet) -> Result<Value, InvokeError> + Send + Sync>;
pub type SetFn = Arc<dyn Fn(PropertySet) -> Result<(), InvokeError> + Send + Sync>;

#[derive(Clone)]
pub struct MethodSlot {
    pub name: &'static str,
    pub invoke: MethodFn,
}

#[derive(Clone, Default)]
pub struct PropertySlot {
    pub name: &'static str,
    pub get: Option<GetFn>,
    pub set: Option<SetFn>,
}

/// Resolved dispatch tables for one shared interface: member id to
/// invokable. Indexers are properties whose accessors take index arguments.
#[derive(Default)]
pub struct LocalData {
    pub methods: HashMap<MethodId, MethodSlot>,
    pub properties: HashMap<PropertyId, PropertySlot>,
}

impl LocalData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method(
        mut self,
        id: u16,
        name: &'static str,
        invoke: impl Fn(MethodCall) -> BoxFuture<Result<Value, InvokeError>> + Send + Sync + 'static,
    ) -> Self {
        self.methods.insert(
            MethodId(id),
            MethodSlot {
                name,
                invoke: Arc::new(invoke),
            },
        );
        self
    }

    pub fn getter(
        mut self,
        id: u16,
        name: &'static str,
        get: impl Fn(PropertyGet) -> Result<Value, InvokeError> + Send + Sync + 'static,
    ) -> Self {
        let slot = self.properties.entry(PropertyId(id)).or_default();
        slot.name = name;
        slot.get = Some(Arc::new(get));
        self
    }

    pub fn setter(
        mut self,
        id: u16,
        name: &'static str,
        set: impl Fn(PropertySet) -> Result<(), InvokeError> + Send + Sync + 'static,
    ) -> Self {
        let slot = self.properties.entry(PropertyId(id)).or_default();
        slot.name = name;
        slot.set = Some(Arc::new(set));
        self
    }
}

/// The consumed binder interface.
pub trait ProxyBinder: Send + Sync {
    /// Builds a concrete proxy for `iface`, embedding `grip`.
    ///
    /// Implementations construct and return; installing the proxy in the
    /// tables (and racing concurrent rebuilds) is the engine's job.
    fn remote_proxy(
        &self,
        iface: &str,
        grip: ProxyGrip,
    ) -> Result<Arc<dyn ProxyObject>, RpcError>;

    /// Dispatch tables for a shared interface implemented locally, or `None`
    /// if the interface is unknown.
    fn local_data(&self, iface: &str) -> Option<Arc<LocalData>>;
}
