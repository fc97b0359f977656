//! Keyed atomic store.
//!
//! A concurrent map from string key to value where every key carries its own
//! lock. Actions registered for one key run one at a time; actions for
//! different keys never wait on each other.
//!
//! Each key owns a slot `Arc<Mutex<Option<T>>>`. The mutex is the per-key
//! lock and the `Option` is the value. A slot that is reachable from the map
//! while holding `None` after its creator released it means a value went
//! missing behind a live lock, which is reported as an internal
//! inconsistency.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{ArcMutexGuard, Mutex, RawMutex};

use crate::error::{CorrResult, CorrelatorError};

type Slot<T> = Arc<Mutex<Option<T>>>;
type SlotGuard<T> = ArcMutexGuard<RawMutex, Option<T>>;

/// Concurrent key → value map with per-key mutual exclusion.
#[derive(Debug)]
pub struct KeyedAtomicStore<T> {
    slots: DashMap<String, Slot<T>>,
}

impl<T> Default for KeyedAtomicStore<T> {
    fn default() -> Self {
        Self {
            slots: DashMap::new(),
        }
    }
}

impl<T> KeyedAtomicStore<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `value` under `key` if the key is absent. No-op otherwise.
    pub fn add(&self, key: &str, value: T) {
        if let Entry::Vacant(vacant) = self.slots.entry(key.to_string()) {
            vacant.insert(Arc::new(Mutex::new(Some(value))));
        }
    }

    /// Runs `action` on the value for `key`, creating it from `default` first
    /// if needed, while holding the key's lock.
    pub fn get_or_add_and_action<R>(
        &self,
        key: &str,
        default: impl FnOnce() -> T,
        action: impl FnOnce(&mut T) -> R,
    ) -> R {
        let (_, mut guard) = self.lock_or_create(key);
        let value = guard.get_or_insert_with(default);
        action(value)
    }

    /// Runs `action` on the existing value for `key` while holding its lock.
    ///
    /// Returns `Ok(None)` without running `action` when the key is absent, and
    /// an internal error when a lock is present without a value.
    pub fn get_and_action<R>(
        &self,
        key: &str,
        action: impl FnOnce(&mut T) -> R,
    ) -> CorrResult<Option<R>> {
        let Some((_, mut guard)) = self.lock_existing(key) else {
            return Ok(None);
        };
        let Some(value) = (*guard).as_mut() else {
            return Err(CorrelatorError::internal(format!(
                "keyed store holds a lock for '{key}' without a value"
            )));
        };
        Ok(Some(action(value)))
    }

    /// Runs `action` on the current value (if any) and removes the key while
    /// still holding its lock.
    ///
    /// Returns false without running `action` when no lock exists for `key`.
    pub fn action_and_remove(&self, key: &str, action: impl FnOnce(Option<T>)) -> bool {
        let Some((slot, mut guard)) = self.lock_existing(key) else {
            return false;
        };
        action(guard.take());
        self.slots.remove_if(key, |_, current| Arc::ptr_eq(current, &slot));
        true
    }

    /// Discards the value and lock for `key` if present.
    pub fn remove(&self, key: &str) {
        self.slots.remove(key);
    }

    /// Snapshot of the present keys. Concurrent mutation may or may not be reflected.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.slots.iter().map(|entry| entry.key().clone()).collect()
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.slots.contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn clear(&self) {
        self.slots.clear();
    }

    fn is_current(&self, key: &str, slot: &Slot<T>) -> bool {
        self.slots
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current.value(), slot))
    }

    /// Locks the slot for `key`, retrying when the slot was removed or
    /// replaced while we waited on it.
    fn lock_existing(&self, key: &str) -> Option<(Slot<T>, SlotGuard<T>)> {
        loop {
            let slot = Arc::clone(self.slots.get(key)?.value());
            let guard = Mutex::lock_arc(&slot);
            if self.is_current(key, &slot) {
                return Some((slot, guard));
            }
        }
    }

    /// Like [`Self::lock_existing`] but creates the slot if missing. A new
    /// slot is locked before it becomes visible, so nobody observes it empty.
    fn lock_or_create(&self, key: &str) -> (Slot<T>, SlotGuard<T>) {
        loop {
            let slot = match self.slots.entry(key.to_string()) {
                Entry::Occupied(occupied) => Arc::clone(occupied.get()),
                Entry::Vacant(vacant) => {
                    let slot: Slot<T> = Arc::new(Mutex::new(None));
                    let guard = Mutex::lock_arc(&slot);
                    vacant.insert(Arc::clone(&slot));
                    return (slot, guard);
                }
            };
            let guard = Mutex::lock_arc(&slot);
            if self.is_current(key, &slot) {
                return (slot, guard);
            }
        }
    }
}
