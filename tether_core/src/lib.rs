//! `tether_core`
//!
//! Bidirectional, object-oriented RPC over one duplex link: a reliable
//! framed stream for requests and replies plus an unreliable datagram
//! channel for fire-and-forget calls.
//!
//! Model:
//! - Objects whose declared interface is shareable cross the wire as
//!   reference ids; the receiver gets a proxy that forwards members back.
//! - References are transitive and reference-counted; dropping the last
//!   proxy credits the owner, which reclaims the object.
//! - Both sides of a connection are the same symmetric [`endpoint::Endpoint`];
//!   only the handshake differs.
//!
//! The proxy binder and the serializer are consumed interfaces
//! ([`binder::ProxyBinder`], [`serializer::Serializer`]); the engine ships a
//! JSON serializer as the default.

pub mod binder;
pub mod channel;
pub mod config;
mod dispatch;
pub mod endpoint;
pub mod error;
pub mod serializer;
pub mod table;
pub mod value;
pub mod wire;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::binder::{
        LocalData, MethodCall, PropertyGet, PropertySet, ProxyBinder, ProxyGrip, ProxyObject,
        ShareableObject,
    };
    pub use crate::config::EndpointConfig;
    pub use crate::endpoint::{Endpoint, PendingReply};
    pub use crate::error::{InvokeError, RemoteException, RpcError};
    pub use crate::serializer::{JsonSerializer, Serializer};
    pub use crate::value::Value;
    pub use crate::wire::{MethodId, NetworkId, ObjectId, OperationId, PropertyId, ROOT_OBJECT};
}
