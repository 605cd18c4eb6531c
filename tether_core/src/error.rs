//! Error surface of the engine.
//!
//! The kinds mirror the failure classes a caller can actually observe:
//! local misuse (`InUse`, `Disconnected`), table caps (`Overflow`), peer-side
//! invocation failure (`Remote`), transport failure (`Io`), and stream
//! corruption or counting divergence (`Protocol`).

use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// An error raised by the peer's invocation body, carried across the wire.
///
/// `source` is a label for the component that produced the error, not a
/// nested cause.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteException {
    pub type_name: String,
    pub message: String,
    pub stack: String,
    pub source: String,
}

impl fmt::Display for RemoteException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.type_name, self.message)
    }
}

impl std::error::Error for RemoteException {}

impl RemoteException {
    /// Reply for a request naming an object id that is not in our held table.
    pub fn access_denied(object: u16) -> Self {
        Self {
            type_name: "AccessDenied".to_string(),
            message: format!("this endpoint does not hold object {object}"),
            stack: std::backtrace::Backtrace::force_capture().to_string(),
            source: "tether".to_string(),
        }
    }

    /// Reply for a request naming a member id the target interface lacks.
    pub fn missing_member(kind: &str, member: u16, iface: &str) -> Self {
        Self {
            type_name: "MissingMember".to_string(),
            message: format!("interface {iface} has no {kind} {member}"),
            stack: std::backtrace::Backtrace::force_capture().to_string(),
            source: "tether".to_string(),
        }
    }

    pub fn from_invoke(err: InvokeError, iface: &str) -> Self {
        Self {
            type_name: err.type_name,
            message: err.message,
            stack: std::backtrace::Backtrace::force_capture().to_string(),
            source: iface.to_string(),
        }
    }
}

/// What an invocation body fails with on the owner side. Converted into a
/// [`RemoteException`] before it crosses the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvokeError {
    pub type_name: String,
    pub message: String,
}

impl InvokeError {
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for InvokeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.type_name, self.message)
    }
}

impl std::error::Error for InvokeError {}

/// Engine error returned by every public `Endpoint` operation.
#[derive(Debug, Error)]
pub enum RpcError {
    /// `connect` on an endpoint that is already in use (or used up).
    #[error("endpoint is already in use")]
    InUse,
    /// Operation attempted on an endpoint that is not connected.
    #[error("endpoint is not connected")]
    Disconnected,
    /// A table cap was exceeded; the connection is torn down after this.
    #[error("capacity exceeded: {0}")]
    Overflow(&'static str),
    /// The peer's invocation body failed.
    #[error(transparent)]
    Remote(#[from] RemoteException),
    /// Transport failure.
    #[error("transport failure: {0}")]
    Io(#[from] io::Error),
    /// Stream corruption, counting divergence, or a collaborator contract
    /// violation. Fatal for the connection.
    #[error("protocol fault: {0}")]
    Protocol(String),
}

impl RpcError {
    /// The error every pending operation completes with at teardown.
    pub(crate) fn disconnected_io() -> Self {
        RpcError::Io(io::Error::new(
            io::ErrorKind::ConnectionAborted,
            "disconnected while processing this operation",
        ))
    }
}

/// Transport errors that mean "the peer went away" rather than "something
/// broke": these invoke `on_disconnected` but not `on_network_error`.
pub fn is_expected_close(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_exception_roundtrip() {
        let re = RemoteException {
            type_name: "KeyNotFound".to_string(),
            message: "no such key".to_string(),
            stack: "at lookup".to_string(),
            source: "tests".to_string(),
        };
        let json = serde_json::to_string(&re).unwrap();
        let back: RemoteException = serde_json::from_str(&json).unwrap();
        assert_eq!(re, back);
    }

    #[test]
    fn expected_close_classification() {
        let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "eof");
        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        let other = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        assert!(is_expected_close(&eof));
        assert!(is_expected_close(&reset));
        assert!(!is_expected_close(&other));
    }
}
