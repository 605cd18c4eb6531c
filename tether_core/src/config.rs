//! Endpoint configuration.

use std::io;
use std::sync::Arc;

use tokio::runtime::Handle;

use crate::binder::{ProxyBinder, ShareableObject};
use crate::serializer::{JsonSerializer, Serializer};

pub type NetworkErrorHook = Arc<dyn Fn(&io::Error) + Send + Sync>;
pub type DisconnectedHook = Arc<dyn Fn() + Send + Sync>;

/// Distinct-entry bound implied by the 16-bit id space.
pub const ID_SPACE: usize = u16::MAX as usize + 1;

/// Per-endpoint wiring chosen at construction.
#[derive(Clone)]
pub struct EndpointConfig {
    /// Bootstrap root installed as object 0 at handshake: the object the
    /// peer starts from.
    pub root: Arc<dyn ShareableObject>,
    pub binder: Arc<dyn ProxyBinder>,
    pub serializer: Arc<dyn Serializer>,
    /// Cap on distinct local objects the peer may reference. Exceeding it is
    /// fatal for the connection.
    pub max_held_objects: usize,
    /// Cap on distinct peer objects we may reference. Exceeding it is fatal
    /// for the connection.
    pub max_remote_objects: usize,
    /// Where inbound invocation bodies run. Defaults to the runtime current
    /// at connect/accept time.
    pub scheduler: Option<Handle>,
    /// Observer for unexpected transport failures. Invoked at most once.
    pub on_network_error: Option<NetworkErrorHook>,
    /// Observer for teardown. Invoked at most once.
    pub on_disconnected: Option<DisconnectedHook>,
}

impl EndpointConfig {
    pub fn new(root: Arc<dyn ShareableObject>, binder: Arc<dyn ProxyBinder>) -> Self {
        Self {
            root,
            binder,
            serializer: Arc::new(JsonSerializer),
            max_held_objects: ID_SPACE,
            max_remote_objects: ID_SPACE,
            scheduler: None,
            on_network_error: None,
            on_disconnected: None,
        }
    }
}
