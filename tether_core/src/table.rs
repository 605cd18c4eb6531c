//! Endpoint state tables.
//!
//! Held objects (what the peer may reference), remote proxies (what we
//! reference of the peer's), and pending operations, plus the recycling id
//! allocator they all draw from. Multi-step mutations happen under the
//! endpoint's master lock; nothing here takes locks of its own.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use tokio::sync::oneshot;

use crate::binder::{ProxyObject, ShareableObject};
use crate::error::RpcError;
use crate::value::{object_identity, Value};
use crate::wire::{ObjectId, OperationId};

/// u16 allocator that recycles freed slots before growing.
#[derive(Debug, Default)]
pub struct IdPool {
    next: u32,
    free: Vec<u16>,
}

impl IdPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&mut self) -> Option<u16> {
        if let Some(id) = self.free.pop() {
            return Some(id);
        }
        if self.next > u16::MAX as u32 {
            return None;
        }
        let id = self.next as u16;
        self.next += 1;
        Some(id)
    }

    pub fn release(&mut self, id: u16) {
        self.free.push(id);
    }
}

struct HeldEntry {
    object: Arc<dyn ShareableObject>,
    send_count: u64,
}

/// Owner-side table: id to object with per-id send-counts and a by-identity
/// inverse so re-sending an object reuses its id.
#[derive(Default)]
pub struct HeldTable {
    ids: IdPool,
    entries: HashMap<ObjectId, HeldEntry>,
    by_identity: HashMap<usize, ObjectId>,
}

impl HeldTable {
    /// Existing id (send-count bumped) or a fresh entry with count 1.
    /// `cap` bounds the number of distinct entries.
    pub fn register_for_send(
        &mut self,
        obj: &Arc<dyn ShareableObject>,
        cap: usize,
    ) -> Result<ObjectId, RpcError> {
        let identity = object_identity(obj);
        if let Some(&id) = self.by_identity.get(&identity) {
            let entry = self
                .entries
                .get_mut(&id)
                .expect("identity index out of sync with entries");
            entry.send_count += 1;
            return Ok(id);
        }
        if self.entries.len() >= cap {
            return Err(RpcError::Overflow("held-object table is full"));
        }
        let id = ObjectId(
            self.ids
                .allocate()
                .ok_or(RpcError::Overflow("held-object ids exhausted"))?,
        );
        self.entries.insert(
            id,
            HeldEntry {
                object: obj.clone(),
                send_count: 1,
            },
        );
        self.by_identity.insert(identity, id);
        Ok(id)
    }

    pub fn get(&self, id: ObjectId) -> Option<Arc<dyn ShareableObject>> {
        self.entries.get(&id).map(|e| e.object.clone())
    }

    /// Credits a `Release(count)` from the peer. Returns the removed object
    /// (to be dropped outside the master lock) when the count reaches zero;
    /// an unknown id is a no-op; driving an existing count below zero is
    /// counting divergence and fails.
    pub fn credit_release(
        &mut self,
        id: ObjectId,
        count: u64,
    ) -> Result<Option<Arc<dyn ShareableObject>>, RpcError> {
        let Some(entry) = self.entries.get_mut(&id) else {
            return Ok(None);
        };
        if count > entry.send_count {
            return Err(RpcError::Protocol(format!(
                "release of {count} drives object {} send-count below zero (held {})",
                id.0, entry.send_count
            )));
        }
        entry.send_count -= count;
        if entry.send_count == 0 {
            let entry = self
                .entries
                .remove(&id)
                .expect("entry vanished under the lock");
            self.by_identity.remove(&object_identity(&entry.object));
            self.ids.release(id.0);
            return Ok(Some(entry.object));
        }
        Ok(None)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    pub fn send_count(&self, id: ObjectId) -> Option<u64> {
        self.entries.get(&id).map(|e| e.send_count)
    }

    /// Empties the table, handing every object back so callers can drop them
    /// outside the master lock.
    pub fn drain_objects(&mut self) -> Vec<Arc<dyn ShareableObject>> {
        self.by_identity.clear();
        self.ids = IdPool::new();
        self.entries.drain().map(|(_, e)| e.object).collect()
    }
}

struct ProxyEntry {
    weak: Weak<dyn ProxyObject>,
    inbound: u64,
    generation: u64,
}

/// Receiver-side table: weak proxy handles with inbound occurrence counts.
/// The generation distinguishes a rebuilt proxy from the dying instance it
/// replaced.
#[derive(Default)]
pub struct ProxyTable {
    entries: HashMap<ObjectId, ProxyEntry>,
    next_generation: u64,
}

impl ProxyTable {
    /// Live proxy for the id, with its inbound count bumped.
    pub fn resolve_live(&mut self, id: ObjectId) -> Option<Arc<dyn ProxyObject>> {
        let entry = self.entries.get_mut(&id)?;
        let proxy = entry.weak.upgrade()?;
        entry.inbound += 1;
        Some(proxy)
    }

    /// Removes an expired entry, returning the count stranded on the dying
    /// instance. Only meaningful after `resolve_live` returned `None`.
    pub fn take_expired(&mut self, id: ObjectId) -> Option<u64> {
        let expired = matches!(
            self.entries.get(&id),
            Some(entry) if entry.weak.strong_count() == 0
        );
        if expired {
            self.entries.remove(&id).map(|e| e.inbound)
        } else {
            None
        }
    }

    pub fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    /// Installs a freshly built proxy with inbound count 1.
    pub fn install(&mut self, id: ObjectId, weak: Weak<dyn ProxyObject>, generation: u64) {
        self.entries.insert(
            id,
            ProxyEntry {
                weak,
                inbound: 1,
                generation,
            },
        );
    }

    /// Called when a proxy instance is dropped. Removes the entry and yields
    /// its inbound count if the generation still matches; a mismatch means
    /// the slot was already rebuilt and the dying instance was credited by
    /// the rebuilder.
    pub fn drop_instance(&mut self, id: ObjectId, generation: u64) -> Option<u64> {
        let matches = matches!(
            self.entries.get(&id),
            Some(entry) if entry.generation == generation
        );
        if matches {
            self.entries.remove(&id).map(|e| e.inbound)
        } else {
            None
        }
    }

    pub fn distinct(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Outstanding request futures keyed by operation id.
#[derive(Default)]
pub struct PendingTable {
    ids: IdPool,
    entries: HashMap<OperationId, oneshot::Sender<Result<Value, RpcError>>>,
}

impl PendingTable {
    pub fn allocate(
        &mut self,
        tx: oneshot::Sender<Result<Value, RpcError>>,
    ) -> Option<OperationId> {
        let op = OperationId(self.ids.allocate()?);
        self.entries.insert(op, tx);
        Some(op)
    }

    /// Removes the waiter, recycling the id. `None` if the operation already
    /// completed (or never existed).
    pub fn complete(
        &mut self,
        op: OperationId,
    ) -> Option<oneshot::Sender<Result<Value, RpcError>>> {
        let tx = self.entries.remove(&op)?;
        self.ids.release(op.0);
        Some(tx)
    }

    pub fn drain(&mut self) -> Vec<oneshot::Sender<Result<Value, RpcError>>> {
        self.ids = IdPool::new();
        self.entries.drain().map(|(_, tx)| tx).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Everything the master lock guards.
#[derive(Default)]
pub(crate) struct Tables {
    pub held: HeldTable,
    pub proxies: ProxyTable,
    pub pending: PendingTable,
}

#[cfg(test)]
mod tests {
    use std::any::Any;

    use super::*;

    struct Obj;

    impl ShareableObject for Obj {
        fn interface(&self) -> &'static str {
            "tests.Obj"
        }
        fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }

    #[test]
    fn id_pool_recycles_freed_slots() {
        let mut pool = IdPool::new();
        assert_eq!(pool.allocate(), Some(0));
        assert_eq!(pool.allocate(), Some(1));
        pool.release(0);
        assert_eq!(pool.allocate(), Some(0));
        assert_eq!(pool.allocate(), Some(2));
    }

    #[test]
    fn register_reuses_id_and_counts_sends() {
        let mut table = HeldTable::default();
        let obj: Arc<dyn ShareableObject> = Arc::new(Obj);
        let id = table.register_for_send(&obj, usize::MAX).unwrap();
        let again = table.register_for_send(&obj, usize::MAX).unwrap();
        assert_eq!(id, again);
        assert_eq!(table.len(), 1);
        assert_eq!(table.send_count(id), Some(2));
    }

    #[test]
    fn partial_release_keeps_entry_final_release_removes_it() {
        let mut table = HeldTable::default();
        let obj: Arc<dyn ShareableObject> = Arc::new(Obj);
        let id = table.register_for_send(&obj, usize::MAX).unwrap();
        for _ in 0..4 {
            table.register_for_send(&obj, usize::MAX).unwrap();
        }

        assert!(table.credit_release(id, 2).unwrap().is_none());
        assert_eq!(table.send_count(id), Some(3));

        let removed = table.credit_release(id, 3).unwrap();
        assert!(removed.is_some());
        assert!(table.is_empty());

        // The id is free again and a re-send starts a fresh entry.
        let id2 = table.register_for_send(&obj, usize::MAX).unwrap();
        assert_eq!(table.send_count(id2), Some(1));
    }

    #[test]
    fn release_of_unknown_id_is_a_noop() {
        let mut table = HeldTable::default();
        assert!(table.credit_release(ObjectId(9), 3).unwrap().is_none());
    }

    #[test]
    fn release_below_zero_is_divergence() {
        let mut table = HeldTable::default();
        let obj: Arc<dyn ShareableObject> = Arc::new(Obj);
        let id = table.register_for_send(&obj, usize::MAX).unwrap();
        let err = match table.credit_release(id, 2) {
            Err(err) => err,
            Ok(_) => panic!("expected credit_release to fail"),
        };
        assert!(matches!(err, RpcError::Protocol(_)));
    }

    #[test]
    fn held_cap_is_enforced_per_distinct_object() {
        let mut table = HeldTable::default();
        let a: Arc<dyn ShareableObject> = Arc::new(Obj);
        let b: Arc<dyn ShareableObject> = Arc::new(Obj);
        let c: Arc<dyn ShareableObject> = Arc::new(Obj);
        table.register_for_send(&a, 2).unwrap();
        table.register_for_send(&b, 2).unwrap();
        // Re-sends of known objects stay fine at the cap.
        table.register_for_send(&a, 2).unwrap();
        let err = table.register_for_send(&c, 2).unwrap_err();
        assert!(matches!(err, RpcError::Overflow(_)));
    }

    #[test]
    fn pending_ids_are_unique_while_in_flight() {
        let mut table = PendingTable::default();
        let mut ops = std::collections::HashSet::new();
        let mut waiting = Vec::new();
        for _ in 0..64 {
            let (tx, rx) = oneshot::channel();
            let op = table.allocate(tx).unwrap();
            assert!(ops.insert(op), "operation id {op:?} issued twice");
            waiting.push(rx);
        }
        assert_eq!(table.len(), 64);
        for op in ops {
            assert!(table.complete(op).is_some());
            assert!(table.complete(op).is_none(), "completed twice");
        }
        assert!(table.is_empty());
    }
}
