//! Client-side snapshot cache with a previous-version slot.
//!
//! Callers render a target state before the store confirms it. Every
//! optimistic write captures the value it replaced so a failed call can be
//! reverted synchronously. At most one unconfirmed write per key.

use std::collections::HashMap;
use std::hash::Hash;

use crate::error::{Result, SuprimentoError};

#[derive(Debug, Clone)]
struct Slot<V> {
    current: V,
    previous: Option<V>,
}

#[derive(Debug, Clone)]
pub struct SnapshotCache<K, V> {
    slots: HashMap<K, Slot<V>>,
}

impl<K, V> Default for SnapshotCache<K, V> {
    fn default() -> Self {
        Self {
            slots: HashMap::new(),
        }
    }
}

impl<K: Eq + Hash + std::fmt::Debug, V: Clone> SnapshotCache<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.slots.get(key).map(|s| &s.current)
    }

    /// Value an unconfirmed write replaced, if one is pending.
    pub fn previous(&self, key: &K) -> Option<&V> {
        self.slots.get(key).and_then(|s| s.previous.as_ref())
    }

    pub fn is_pending(&self, key: &K) -> bool {
        self.previous(key).is_some()
    }

    /// Stores an authoritative value, discarding any pending write.
    pub fn put(&mut self, key: K, value: V) {
        self.slots.insert(
            key,
            Slot {
                current: value,
                previous: None,
            },
        );
    }

    /// Renders `value` immediately, keeping the replaced value for rollback.
    pub fn apply(&mut self, key: K, value: V) -> Result<()> {
        let Some(slot) = self.slots.get_mut(&key) else {
            return Err(SuprimentoError::validation(format!(
                "no cached value for {key:?} to update"
            )));
        };
        if slot.previous.is_some() {
            return Err(SuprimentoError::validation(format!(
                "a transition is already pending for {key:?}"
            )));
        }
        let replaced = std::mem::replace(&mut slot.current, value);
        slot.previous = Some(replaced);
        Ok(())
    }

    /// Keeps the optimistic value.
    pub fn confirm(&mut self, key: &K) {
        if let Some(slot) = self.slots.get_mut(key) {
            slot.previous = None;
        }
    }

    /// Restores the value the pending write replaced. Returns it.
    pub fn rollback(&mut self, key: &K) -> Option<V> {
        let slot = self.slots.get_mut(key)?;
        let previous = slot.previous.take()?;
        slot.current = previous.clone();
        Some(previous)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.slots.remove(key).map(|s| s.current)
    }
}
