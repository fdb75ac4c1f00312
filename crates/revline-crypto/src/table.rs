//! Session table with one exclusive lock per session key.
//!
//! The outer map lock is held only long enough to find or insert a slot;
//! ratchet work happens under the slot's own lock, so operations on
//! different keys never wait on each other. A slot left empty is dropped
//! from the map once its last user lets go, so lookups for unknown ids do
//! not accumulate.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

/// A cached session, `None` until loaded from storage (or when absent).
type Slot<S> = Arc<Mutex<Option<S>>>;

pub(crate) struct SessionTable<K, S> {
    slots: Mutex<HashMap<K, Slot<S>>>,
}

impl<K: Eq + Hash + Clone, S> SessionTable<K, S> {
    pub(crate) fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Handle on the slot for `key`, created empty on first use.
    pub(crate) fn entry(&self, key: &K) -> SlotEntry<'_, K, S> {
        let slot = {
            let mut slots = self.slots.lock();
            Arc::clone(
                slots
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(Mutex::new(None))),
            )
        };
        SlotEntry {
            table: self,
            key: key.clone(),
            slot,
        }
    }

    /// Forget every cached session.
    pub(crate) fn clear(&self) {
        self.slots.lock().clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// Drop `key`'s slot if it is empty and `slot` is its only outside user.
    fn release(&self, key: &K, slot: &Slot<S>) {
        let mut slots = self.slots.lock();
        let vacant = slots.get(key).is_some_and(|current| {
            Arc::ptr_eq(current, slot)
                && Arc::strong_count(current) == 2
                && current.try_lock().is_some_and(|session| session.is_none())
        });
        if vacant {
            slots.remove(key);
        }
    }
}

/// Shared handle on one slot. Lock it for the duration of an operation;
/// the slot is pruned on drop if it ended up empty.
pub(crate) struct SlotEntry<'a, K: Eq + Hash + Clone, S> {
    table: &'a SessionTable<K, S>,
    key: K,
    slot: Slot<S>,
}

impl<K: Eq + Hash + Clone, S> SlotEntry<'_, K, S> {
    pub(crate) fn lock(&self) -> MutexGuard<'_, Option<S>> {
        self.slot.lock()
    }
}

impl<K: Eq + Hash + Clone, S> Drop for SlotEntry<'_, K, S> {
    fn drop(&mut self) {
        self.table.release(&self.key, &self.slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_key_shares_slot() {
        let table: SessionTable<String, u32> = SessionTable::new();
        *table.entry(&"bob".to_string()).lock() = Some(7);
        assert_eq!(*table.entry(&"bob".to_string()).lock(), Some(7));
        assert!(table.entry(&"carol".to_string()).lock().is_none());
    }

    #[test]
    fn different_keys_lock_independently() {
        let table: SessionTable<String, u32> = SessionTable::new();
        let bob = table.entry(&"bob".to_string());
        let _held = bob.lock();
        let carol = table.entry(&"carol".to_string());
        *carol.lock() = Some(2);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn empty_slots_are_released() {
        let table: SessionTable<String, u32> = SessionTable::new();
        for i in 0..100 {
            assert!(table.entry(&format!("stranger{i}")).lock().is_none());
        }
        assert_eq!(table.len(), 0);

        *table.entry(&"bob".to_string()).lock() = Some(1);
        assert_eq!(table.len(), 1);
        *table.entry(&"bob".to_string()).lock() = None;
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn slot_in_use_is_not_released() {
        let table: SessionTable<String, u32> = SessionTable::new();
        let first = table.entry(&"bob".to_string());
        {
            let second = table.entry(&"bob".to_string());
            assert!(second.lock().is_none());
        }
        assert_eq!(table.len(), 1);
        *first.lock() = Some(3);
        drop(first);
        assert_eq!(*table.entry(&"bob".to_string()).lock(), Some(3));
    }

    #[test]
    fn clear_drops_cached_sessions() {
        let table: SessionTable<String, u32> = SessionTable::new();
        *table.entry(&"bob".to_string()).lock() = Some(1);
        table.clear();
        assert!(table.entry(&"bob".to_string()).lock().is_none());
    }
}
