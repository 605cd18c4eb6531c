//! Inbound message dispatch.
//!
//! One reader task per channel decodes frames and routes them by kind. The
//! rule that holds everything together: user code never runs on a reader.
//! Invocation bodies are spawned onto the endpoint's scheduler handle, and
//! reply completions wake the caller's own task through its oneshot.

use std::io;
use std::sync::Arc;

use tokio::net::tcp::OwnedReadHalf;
use tracing::{debug, warn};

use crate::binder::{MethodCall, PropertyGet, PropertySet};
use crate::channel;
use crate::endpoint::EndpointShared;
use crate::error::{InvokeError, RemoteException, RpcError};
use crate::serializer::RefHooks;
use crate::value::Value;
use crate::wire::{Message, MethodId, ObjectId, OperationId, PropertyId};

#[derive(Debug, Clone, Copy)]
enum ReplyKind {
    Method,
    Property,
    Indexer,
}

/// Single consumer of the reliable stream. Anything that fails decode or
/// violates the counting rules is a protocol fault and ends the connection.
pub(crate) async fn run_reliable_reader(shared: Arc<EndpointShared>, mut read_half: OwnedReadHalf) {
    loop {
        match channel::read_frame(&mut read_half).await {
            Ok(frame) => {
                if let Err(err) = dispatch_reliable(&shared, &frame) {
                    warn!(error = %err, "protocol fault on reliable channel");
                    shared.teardown(Some(io::Error::new(
                        io::ErrorKind::InvalidData,
                        err.to_string(),
                    )));
                    return;
                }
            }
            Err(err) => {
                shared.teardown(Some(err));
                return;
            }
        }
    }
}

fn dispatch_reliable(shared: &Arc<EndpointShared>, frame: &[u8]) -> Result<(), RpcError> {
    let msg = shared.serializer.decode(frame, &**shared)?;
    match msg {
        Message::CallMethod {
            target,
            method,
            generics,
            args,
            operation,
        } => handle_method(shared, target, method, generics, args, Some(operation)),
        Message::CallMethodUnreliable {
            target,
            method,
            generics,
            args,
        } => handle_method(shared, target, method, generics, args, None),
        Message::GetProperty {
            target,
            property,
            operation,
        } => handle_get(shared, target, property, vec![], operation, ReplyKind::Property),
        Message::SetProperty {
            target,
            property,
            value,
            operation,
        } => handle_set(
            shared,
            target,
            property,
            value,
            vec![],
            operation,
            ReplyKind::Property,
        ),
        Message::GetIndexer {
            target,
            property,
            index,
            operation,
        } => handle_get(shared, target, property, index, operation, ReplyKind::Indexer),
        Message::SetIndexer {
            target,
            property,
            value,
            index,
            operation,
        } => handle_set(
            shared,
            target,
            property,
            value,
            index,
            operation,
            ReplyKind::Indexer,
        ),
        Message::ReturnMethod {
            operation,
            result,
            error,
        }
        | Message::ReturnProperty {
            operation,
            result,
            error,
        }
        | Message::ReturnIndexer {
            operation,
            result,
            error,
        } => {
            complete_operation(shared, operation, result, error);
            Ok(())
        }
        Message::Release { count, target } => shared.credit_release(target, count),
    }
}

/// Unreliable intake: one datagram at a time, invocation awaited inline, so
/// deliveries are observed in transmit order. The executor task this runs on
/// is spawned onto the endpoint's scheduler handle; the socket reader only
/// forwards bytes. Undecodable datagrams are dropped (the channel is lossy
/// anyway); a cap overflow during decode is still fatal.
pub(crate) async fn run_unreliable(shared: &Arc<EndpointShared>, payload: &[u8]) {
    if !shared.is_connected() {
        return;
    }
    let msg = match shared.serializer.decode(payload, &**shared) {
        Ok(msg) => msg,
        Err(err) => {
            if matches!(err, RpcError::Overflow(_)) {
                shared.fault_local("table cap exceeded while decoding datagram");
            } else {
                debug!(error = %err, "undecodable datagram dropped");
            }
            return;
        }
    };
    let kind = msg.kind();
    let Message::CallMethodUnreliable {
        target,
        method,
        generics,
        args,
    } = msg
    else {
        debug!(kind, "unexpected kind on unreliable channel");
        return;
    };
    let Some(obj) = shared.retrieve_local(target) else {
        warn!(object = target.0, "peer referenced an object we do not hold");
        return;
    };
    let iface = obj.interface();
    let slot = shared
        .binder
        .local_data(iface)
        .and_then(|data| data.methods.get(&method).cloned());
    let Some(slot) = slot else {
        debug!(object = target.0, method = method.0, "unreliable call to unknown method");
        return;
    };
    let call = MethodCall {
        endpoint: shared.public(),
        target: obj,
        args,
        generics,
    };
    // Callers opted out of feedback: failures end here.
    if let Err(err) = (slot.invoke)(call).await {
        debug!(error = %err, "unreliable invocation failed");
    }
}

fn handle_method(
    shared: &Arc<EndpointShared>,
    target: ObjectId,
    method: MethodId,
    generics: Vec<String>,
    args: Vec<Value>,
    operation: Option<OperationId>,
) -> Result<(), RpcError> {
    let Some(obj) = shared.retrieve_local(target) else {
        denied(shared, target, operation.map(|op| (ReplyKind::Method, op)));
        return Ok(());
    };
    let iface = obj.interface();
    let slot = shared
        .binder
        .local_data(iface)
        .and_then(|data| data.methods.get(&method).cloned());
    let Some(slot) = slot else {
        if let Some(op) = operation {
            send_reply(
                shared,
                ReplyKind::Method,
                op,
                Value::Null,
                Some(RemoteException::missing_member("method", method.0, iface)),
            );
        }
        return Ok(());
    };
    let Some(scheduler) = shared.scheduler() else {
        return Ok(());
    };
    let endpoint = shared.public();
    let task_shared = shared.clone();
    scheduler.spawn(async move {
        let call = MethodCall {
            endpoint,
            target: obj,
            args,
            generics,
        };
        let outcome = (slot.invoke)(call).await;
        match operation {
            Some(op) => finish(&task_shared, ReplyKind::Method, op, outcome, iface),
            // Fire-and-forget callers opted out of feedback.
            None => {
                if let Err(err) = outcome {
                    debug!(error = %err, "unreliable invocation failed");
                }
            }
        }
    });
    Ok(())
}

fn handle_get(
    shared: &Arc<EndpointShared>,
    target: ObjectId,
    property: PropertyId,
    index: Vec<Value>,
    operation: OperationId,
    kind: ReplyKind,
) -> Result<(), RpcError> {
    let Some(obj) = shared.retrieve_local(target) else {
        denied(shared, target, Some((kind, operation)));
        return Ok(());
    };
    let iface = obj.interface();
    let slot = shared
        .binder
        .local_data(iface)
        .and_then(|data| data.properties.get(&property).cloned());
    let Some(slot) = slot else {
        send_reply(
            shared,
            kind,
            operation,
            Value::Null,
            Some(RemoteException::missing_member("property", property.0, iface)),
        );
        return Ok(());
    };
    let Some(scheduler) = shared.scheduler() else {
        return Ok(());
    };
    let task_shared = shared.clone();
    scheduler.spawn(async move {
        let outcome = match &slot.get {
            Some(get) => get(PropertyGet { target: obj, index }),
            None => Err(InvokeError::new(
                "MissingAccessor",
                format!("property {} has no getter", slot.name),
            )),
        };
        finish(&task_shared, kind, operation, outcome, iface);
    });
    Ok(())
}

fn handle_set(
    shared: &Arc<EndpointShared>,
    target: ObjectId,
    property: PropertyId,
    value: Value,
    index: Vec<Value>,
    operation: OperationId,
    kind: ReplyKind,
) -> Result<(), RpcError> {
    let Some(obj) = shared.retrieve_local(target) else {
        denied(shared, target, Some((kind, operation)));
        return Ok(());
    };
    let iface = obj.interface();
    let slot = shared
        .binder
        .local_data(iface)
        .and_then(|data| data.properties.get(&property).cloned());
    let Some(slot) = slot else {
        send_reply(
            shared,
            kind,
            operation,
            Value::Null,
            Some(RemoteException::missing_member("property", property.0, iface)),
        );
        return Ok(());
    };
    let Some(scheduler) = shared.scheduler() else {
        return Ok(());
    };
    let task_shared = shared.clone();
    scheduler.spawn(async move {
        let outcome = match &slot.set {
            Some(set) => set(PropertySet {
                target: obj,
                value,
                index,
            })
            .map(|()| Value::Null),
            None => Err(InvokeError::new(
                "MissingAccessor",
                format!("property {} has no setter", slot.name),
            )),
        };
        finish(&task_shared, kind, operation, outcome, iface);
    });
    Ok(())
}

fn denied(shared: &Arc<EndpointShared>, target: ObjectId, reply: Option<(ReplyKind, OperationId)>) {
    // Protocol fault on the peer's side; worth a log line on ours.
    warn!(object = target.0, "peer referenced an object we do not hold");
    if let Some((kind, operation)) = reply {
        send_reply(
            shared,
            kind,
            operation,
            Value::Null,
            Some(RemoteException::access_denied(target.0)),
        );
    }
}

fn finish(
    shared: &Arc<EndpointShared>,
    kind: ReplyKind,
    operation: OperationId,
    outcome: Result<Value, InvokeError>,
    iface: &str,
) {
    let (result, error) = match outcome {
        Ok(value) => (value, None),
        Err(err) => (Value::Null, Some(RemoteException::from_invoke(err, iface))),
    };
    send_reply(shared, kind, operation, result, error);
}

fn send_reply(
    shared: &Arc<EndpointShared>,
    kind: ReplyKind,
    operation: OperationId,
    result: Value,
    error: Option<RemoteException>,
) {
    let msg = match kind {
        ReplyKind::Method => Message::ReturnMethod {
            operation,
            result,
            error,
        },
        ReplyKind::Property => Message::ReturnProperty {
            operation,
            result,
            error,
        },
        ReplyKind::Indexer => Message::ReturnIndexer {
            operation,
            result,
            error,
        },
    };
    match shared.send_frame(msg) {
        Ok(()) => {}
        Err(RpcError::Overflow(_)) => {
            shared.fault_local("table cap exceeded while encoding reply")
        }
        Err(err) => debug!(error = %err, "reply not delivered"),
    }
}

fn complete_operation(
    shared: &Arc<EndpointShared>,
    operation: OperationId,
    result: Value,
    error: Option<RemoteException>,
) {
    let Some(tx) = shared.tables().pending.complete(operation) else {
        debug!(operation = operation.0, "reply for unknown operation");
        return;
    };
    let outcome = match error {
        Some(remote) => Err(RpcError::Remote(remote)),
        None => Ok(result),
    };
    // The waiter may have been dropped; the value (and any proxies in it)
    // just drop with the send.
    let _ = tx.send(outcome);
}
