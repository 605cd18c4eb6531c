//! The serializer seam.
//!
//! A [`Serializer`] turns whole messages into payload bytes and back. Any
//! embedded value whose runtime type is shareable is translated through the
//! [`RefHooks`] callbacks the endpoint provides, so the serializer never
//! touches the tables directly. [`JsonSerializer`] is the default
//! implementation.

use std::sync::Arc;

use bytes::Bytes;

use crate::binder::{ProxyObject, ShareableObject};
use crate::error::RpcError;
use crate::value::Value;
use crate::wire::{Message, ObjectId, RefOwner, WireValue};

/// Callbacks for translating embedded shared references.
pub trait RefHooks {
    /// Owner side, outbound: the object's existing id or a fresh one; bumps
    /// the send-count either way.
    fn register_local_for_send(
        &self,
        obj: &Arc<dyn ShareableObject>,
    ) -> Result<ObjectId, RpcError>;

    /// Receiver side, inbound: the live proxy for the id, or a freshly built
    /// one when the previous instance was dropped.
    fn resolve_or_build_proxy(
        &self,
        object: ObjectId,
        iface: &str,
    ) -> Result<Arc<dyn ProxyObject>, RpcError>;

    /// Owner side, inbound: one of our own objects coming back. `None` means
    /// the peer referenced something we do not hold.
    fn retrieve_local(&self, object: ObjectId) -> Option<Arc<dyn ShareableObject>>;

    /// Outbound re-marshal of a proxy toward its owner. Fails if the proxy
    /// belongs to a different endpoint.
    fn proxy_send_ref(&self, proxy: &Arc<dyn ProxyObject>) -> Result<ObjectId, RpcError>;
}

/// The consumed serializer interface.
pub trait Serializer: Send + Sync {
    fn encode(&self, msg: Message<Value>, hooks: &dyn RefHooks) -> Result<Bytes, RpcError>;
    fn decode(&self, payload: &[u8], hooks: &dyn RefHooks) -> Result<Message<Value>, RpcError>;
}

/// Default serializer: externally-tagged JSON, shared references as
/// `{ owner, object, iface }` nodes.
#[derive(Debug, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn encode(&self, msg: Message<Value>, hooks: &dyn RefHooks) -> Result<Bytes, RpcError> {
        let wire = msg.try_map(&mut |v| lower(v, hooks))?;
        let payload = serde_json::to_vec(&wire)
            .map_err(|e| RpcError::Protocol(format!("encode failed: {e}")))?;
        Ok(Bytes::from(payload))
    }

    fn decode(&self, payload: &[u8], hooks: &dyn RefHooks) -> Result<Message<Value>, RpcError> {
        let wire: Message<WireValue> = serde_json::from_slice(payload)
            .map_err(|e| RpcError::Protocol(format!("decode failed: {e}")))?;
        wire.try_map(&mut |v| lift(v, hooks))
    }
}

fn lower(value: Value, hooks: &dyn RefHooks) -> Result<WireValue, RpcError> {
    Ok(match value {
        Value::Null => WireValue::Null,
        Value::Bool(v) => WireValue::Bool(v),
        Value::Int(v) => WireValue::Int(v),
        Value::Float(v) => WireValue::Float(v),
        Value::Str(v) => WireValue::Str(v),
        Value::Bytes(v) => WireValue::Bytes(v),
        Value::List(items) => WireValue::List(
            items
                .into_iter()
                .map(|v| lower(v, hooks))
                .collect::<Result<_, _>>()?,
        ),
        Value::Map(entries) => WireValue::Map(
            entries
                .into_iter()
                .map(|(k, v)| Ok((k, lower(v, hooks)?)))
                .collect::<Result<_, RpcError>>()?,
        ),
        Value::Object(obj) => {
            let iface = obj.interface().to_string();
            let object = hooks.register_local_for_send(&obj)?;
            WireValue::Shared {
                owner: RefOwner::Mine,
                object,
                iface,
            }
        }
        Value::Proxy(proxy) => {
            let iface = proxy.grip().interface().to_string();
            let object = hooks.proxy_send_ref(&proxy)?;
            WireValue::Shared {
                owner: RefOwner::Yours,
                object,
                iface,
            }
        }
    })
}

fn lift(value: WireValue, hooks: &dyn RefHooks) -> Result<Value, RpcError> {
    Ok(match value {
        WireValue::Null => Value::Null,
        WireValue::Bool(v) => Value::Bool(v),
        WireValue::Int(v) => Value::Int(v),
        WireValue::Float(v) => Value::Float(v),
        WireValue::Str(v) => Value::Str(v),
        WireValue::Bytes(v) => Value::Bytes(v),
        WireValue::List(items) => Value::List(
            items
                .into_iter()
                .map(|v| lift(v, hooks))
                .collect::<Result<_, _>>()?,
        ),
        WireValue::Map(entries) => Value::Map(
            entries
                .into_iter()
                .map(|(k, v)| Ok((k, lift(v, hooks)?)))
                .collect::<Result<_, RpcError>>()?,
        ),
        WireValue::Shared {
            owner,
            object,
            iface,
        } => match owner {
            // The sender owns it: resolve to (or build) our proxy.
            RefOwner::Mine => Value::Proxy(hooks.resolve_or_build_proxy(object, &iface)?),
            // Our own object coming back: identity is preserved.
            RefOwner::Yours => Value::Object(hooks.retrieve_local(object).ok_or_else(|| {
                RpcError::Protocol(format!(
                    "peer returned reference to object {} which we do not hold",
                    object.0
                ))
            })?),
        },
    })
}

#[cfg(test)]
mod tests {
    use std::any::Any;
    use std::collections::HashMap;
    use std::sync::{Mutex, Weak};

    use super::*;
    use crate::binder::ProxyGrip;
    use crate::wire::{MethodId, OperationId};

    struct StubObject;

    impl ShareableObject for StubObject {
        fn interface(&self) -> &'static str {
            "stub.Object"
        }
        fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    struct StubProxy {
        grip: ProxyGrip,
    }

    impl ProxyObject for StubProxy {
        fn grip(&self) -> &ProxyGrip {
            &self.grip
        }
        fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    /// Table-backed hooks standing in for an endpoint.
    #[derive(Default)]
    struct StubHooks {
        held: Mutex<HashMap<u16, Arc<dyn ShareableObject>>>,
        sends: Mutex<u64>,
    }

    impl RefHooks for StubHooks {
        fn register_local_for_send(
            &self,
            obj: &Arc<dyn ShareableObject>,
        ) -> Result<ObjectId, RpcError> {
            *self.sends.lock().unwrap() += 1;
            self.held.lock().unwrap().insert(7, obj.clone());
            Ok(ObjectId(7))
        }

        fn resolve_or_build_proxy(
            &self,
            object: ObjectId,
            iface: &str,
        ) -> Result<Arc<dyn ProxyObject>, RpcError> {
            Ok(Arc::new(StubProxy {
                grip: ProxyGrip::new(Weak::new(), object, iface.to_string(), 0),
            }))
        }

        fn retrieve_local(&self, object: ObjectId) -> Option<Arc<dyn ShareableObject>> {
            self.held.lock().unwrap().get(&object.0).cloned()
        }

        fn proxy_send_ref(&self, proxy: &Arc<dyn ProxyObject>) -> Result<ObjectId, RpcError> {
            Ok(proxy.grip().object())
        }
    }

    #[test]
    fn data_roundtrip_needs_no_hooks() {
        let hooks = StubHooks::default();
        let msg = Message::ReturnMethod {
            operation: OperationId(3),
            result: Value::List(vec![Value::Int(1), Value::Str("two".to_string())]),
            error: None,
        };
        let bytes = JsonSerializer.encode(msg.clone(), &hooks).unwrap();
        let back = JsonSerializer.decode(&bytes, &hooks).unwrap();
        assert_eq!(back, msg);
        assert_eq!(*hooks.sends.lock().unwrap(), 0);
    }

    #[test]
    fn local_object_lowers_to_owned_reference() {
        let hooks = StubHooks::default();
        let obj: Arc<dyn ShareableObject> = Arc::new(StubObject);
        let msg = Message::CallMethod {
            target: ObjectId(0),
            method: MethodId(0),
            generics: vec![],
            args: vec![Value::Object(obj)],
            operation: OperationId(0),
        };
        let bytes = JsonSerializer.encode(msg, &hooks).unwrap();
        let json = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(json.contains("\"Mine\""), "got {json}");
        assert!(json.contains("stub.Object"), "got {json}");
        assert_eq!(*hooks.sends.lock().unwrap(), 1);
    }

    #[test]
    fn inbound_owned_reference_lifts_to_proxy() {
        let hooks = StubHooks::default();
        let wire: Message<WireValue> = Message::ReturnMethod {
            operation: OperationId(0),
            result: WireValue::Shared {
                owner: RefOwner::Mine,
                object: ObjectId(5),
                iface: "stub.Object".to_string(),
            },
            error: None,
        };
        let bytes = serde_json::to_vec(&wire).unwrap();
        let msg = JsonSerializer.decode(&bytes, &hooks).unwrap();
        match msg {
            Message::ReturnMethod { result, .. } => {
                let proxy = result.into_proxy().expect("expected a proxy");
                assert_eq!(proxy.grip().object(), ObjectId(5));
                assert_eq!(proxy.grip().interface(), "stub.Object");
            }
            other => panic!("unexpected kind {}", other.kind()),
        }
    }

    #[test]
    fn returned_reference_resolves_to_original_object() {
        let hooks = StubHooks::default();
        let obj: Arc<dyn ShareableObject> = Arc::new(StubObject);

        // Outbound: register our object under id 7.
        let out = Message::ReturnMethod {
            operation: OperationId(0),
            result: Value::Object(obj.clone()),
            error: None,
        };
        JsonSerializer.encode(out, &hooks).unwrap();

        // Inbound: the peer hands the same id back as ours.
        let wire: Message<WireValue> = Message::ReturnMethod {
            operation: OperationId(1),
            result: WireValue::Shared {
                owner: RefOwner::Yours,
                object: ObjectId(7),
                iface: "stub.Object".to_string(),
            },
            error: None,
        };
        let bytes = serde_json::to_vec(&wire).unwrap();
        let msg = JsonSerializer.decode(&bytes, &hooks).unwrap();
        match msg {
            Message::ReturnMethod { result, .. } => {
                let back = result.into_object().expect("expected a local object");
                assert_eq!(
                    crate::value::object_identity(&back),
                    crate::value::object_identity(&obj),
                    "round-trip must preserve identity"
                );
            }
            other => panic!("unexpected kind {}", other.kind()),
        }
    }

    #[test]
    fn unknown_returned_reference_is_a_protocol_fault() {
        let hooks = StubHooks::default();
        let wire: Message<WireValue> = Message::ReturnMethod {
            operation: OperationId(0),
            result: WireValue::Shared {
                owner: RefOwner::Yours,
                object: ObjectId(99),
                iface: "stub.Object".to_string(),
            },
            error: None,
        };
        let bytes = serde_json::to_vec(&wire).unwrap();
        let err = JsonSerializer.decode(&bytes, &hooks).unwrap_err();
        assert!(matches!(err, RpcError::Protocol(_)));
    }
}
