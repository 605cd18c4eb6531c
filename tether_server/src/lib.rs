//! `tether_server`
//!
//! The listener side of a tether deployment:
//! - Accepts TCP connections and hands each a fresh [`tether_core::endpoint::Endpoint`].
//! - Allocates per-connection network ids.
//! - Owns the shared UDP socket and routes client-originated datagrams to
//!   the endpoint named by their id prefix.

pub mod listener;

pub use listener::RpcListener;
