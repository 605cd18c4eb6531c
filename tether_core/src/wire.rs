//! Identifiers and message kinds of the wire protocol.
//!
//! A reliable frame is a `u32` little-endian byte count followed by the
//! serializer payload; the payload starts with the message-kind tag (the
//! externally-tagged enum variant name under the default JSON serializer).
//! A client-originated datagram is prefixed with the sender's [`NetworkId`]
//! so the listener can route it; server-originated datagrams are bare.

use serde::{Deserialize, Serialize};

use crate::error::RemoteException;

/// Per-connection endpoint identity, picked by the listener for accepted
/// endpoints and told to the other side at handshake. Not globally
/// meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkId(pub u16);

/// Address of an entry in the owner's held-object table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(pub u16);

/// Member id of a method within a shared interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MethodId(pub u16);

/// Member id of a property (indexers included) within a shared interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PropertyId(pub u16);

/// Handle for one in-flight request/reply pair. Recycled after completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationId(pub u16);

/// The bootstrap root each side installs at handshake. Reserved for the
/// lifetime of the connection.
pub const ROOT_OBJECT: ObjectId = ObjectId(0);

/// Which side of the link owns an embedded shared reference, from the
/// sender's point of view. `Mine` references resolve to a proxy on the
/// receiver; `Yours` references resolve to the receiver's own held object,
/// which is what makes send-then-return round-trips preserve identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefOwner {
    Mine,
    Yours,
}

/// Serializable form of a value: the data model plus embedded shared
/// references already translated to ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<WireValue>),
    Map(Vec<(String, WireValue)>),
    Shared {
        owner: RefOwner,
        object: ObjectId,
        iface: String,
    },
}

/// The ten message kinds, generic over the value representation: the engine
/// works on `Message<Value>` (live objects embedded), the wire carries
/// `Message<WireValue>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message<V> {
    CallMethod {
        target: ObjectId,
        method: MethodId,
        generics: Vec<String>,
        args: Vec<V>,
        operation: OperationId,
    },
    ReturnMethod {
        operation: OperationId,
        result: V,
        error: Option<RemoteException>,
    },
    CallMethodUnreliable {
        target: ObjectId,
        method: MethodId,
        generics: Vec<String>,
        args: Vec<V>,
    },
    GetProperty {
        target: ObjectId,
        property: PropertyId,
        operation: OperationId,
    },
    ReturnProperty {
        operation: OperationId,
        result: V,
        error: Option<RemoteException>,
    },
    SetProperty {
        target: ObjectId,
        property: PropertyId,
        value: V,
        operation: OperationId,
    },
    GetIndexer {
        target: ObjectId,
        property: PropertyId,
        index: Vec<V>,
        operation: OperationId,
    },
    SetIndexer {
        target: ObjectId,
        property: PropertyId,
        value: V,
        index: Vec<V>,
        operation: OperationId,
    },
    ReturnIndexer {
        operation: OperationId,
        result: V,
        error: Option<RemoteException>,
    },
    Release {
        count: u64,
        target: ObjectId,
    },
}

impl<V> Message<V> {
    /// Kind tag for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::CallMethod { .. } => "CallMethod",
            Message::ReturnMethod { .. } => "ReturnMethod",
            Message::CallMethodUnreliable { .. } => "CallMethodUnreliable",
            Message::GetProperty { .. } => "GetProperty",
            Message::ReturnProperty { .. } => "ReturnProperty",
            Message::SetProperty { .. } => "SetProperty",
            Message::GetIndexer { .. } => "GetIndexer",
            Message::SetIndexer { .. } => "SetIndexer",
            Message::ReturnIndexer { .. } => "ReturnIndexer",
            Message::Release { .. } => "Release",
        }
    }

    /// Maps every embedded value through `f`, preserving structure. Used to
    /// lower rich values to wire form and to lift them back.
    pub fn try_map<U, E>(
        self,
        f: &mut impl FnMut(V) -> Result<U, E>,
    ) -> Result<Message<U>, E> {
        fn map_all<V, U, E>(
            items: Vec<V>,
            f: &mut impl FnMut(V) -> Result<U, E>,
        ) -> Result<Vec<U>, E> {
            items.into_iter().map(f).collect()
        }

        Ok(match self {
            Message::CallMethod {
                target,
                method,
                generics,
                args,
                operation,
            } => Message::CallMethod {
                target,
                method,
                generics,
                args: map_all(args, f)?,
                operation,
            },
            Message::ReturnMethod {
                operation,
                result,
                error,
            } => Message::ReturnMethod {
                operation,
                result: f(result)?,
                error,
            },
            Message::CallMethodUnreliable {
                target,
                method,
                generics,
                args,
            } => Message::CallMethodUnreliable {
                target,
                method,
                generics,
                args: map_all(args, f)?,
            },
            Message::GetProperty {
                target,
                property,
                operation,
            } => Message::GetProperty {
                target,
                property,
                operation,
            },
            Message::ReturnProperty {
                operation,
                result,
                error,
            } => Message::ReturnProperty {
                operation,
                result: f(result)?,
                error,
            },
            Message::SetProperty {
                target,
                property,
                value,
                operation,
            } => Message::SetProperty {
                target,
                property,
                value: f(value)?,
                operation,
            },
            Message::GetIndexer {
                target,
                property,
                index,
                operation,
            } => Message::GetIndexer {
                target,
                property,
                index: map_all(index, f)?,
                operation,
            },
            Message::SetIndexer {
                target,
                property,
                value,
                index,
                operation,
            } => Message::SetIndexer {
                target,
                property,
                value: f(value)?,
                index: map_all(index, f)?,
                operation,
            },
            Message::ReturnIndexer {
                operation,
                result,
                error,
            } => Message::ReturnIndexer {
                operation,
                result: f(result)?,
                error,
            },
            Message::Release { count, target } => Message::Release { count, target },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_kind_tag_leads_the_payload() {
        let msg: Message<WireValue> = Message::GetProperty {
            target: ObjectId(3),
            property: PropertyId(1),
            operation: OperationId(7),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.starts_with("{\"GetProperty\""), "got {json}");
    }

    #[test]
    fn wire_message_roundtrip() {
        let msg: Message<WireValue> = Message::CallMethod {
            target: ObjectId(0),
            method: MethodId(4),
            generics: vec!["i64".to_string()],
            args: vec![
                WireValue::Int(42),
                WireValue::Shared {
                    owner: RefOwner::Mine,
                    object: ObjectId(9),
                    iface: "tether.tests.Counter".to_string(),
                },
            ],
            operation: OperationId(1),
        };
        let bytes = serde_json::to_vec(&msg).unwrap();
        let back: Message<WireValue> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn try_map_touches_every_value() {
        let msg: Message<u32> = Message::SetIndexer {
            target: ObjectId(1),
            property: PropertyId(0),
            value: 10,
            index: vec![20, 30],
            operation: OperationId(2),
        };
        let mapped = msg.try_map(&mut |v| Ok::<_, ()>(v * 2)).unwrap();
        match mapped {
            Message::SetIndexer { value, index, .. } => {
                assert_eq!(value, 20);
                assert_eq!(index, vec![40, 60]);
            }
            other => panic!("unexpected kind {}", other.kind()),
        }
    }
}
