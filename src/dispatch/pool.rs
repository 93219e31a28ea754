//! Slot pool: idle-slot tokens used as a capacity hint.
//!
//! The pool never assigns work; it only tells the coordinator how many
//! slots are idle. A slot id is present at most once.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tracing::warn;

pub struct SlotPool {
    idle: Mutex<HashSet<String>>,
}

impl SlotPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            idle: Mutex::new(HashSet::new()),
        })
    }

    /// Mark a slot idle. Returns `false` (and leaves the pool unchanged)
    /// if the slot was already advertised.
    pub fn advertise_idle(&self, slot_id: &str) -> bool {
        let inserted = self.lock().insert(slot_id.to_string());
        if !inserted {
            warn!(slot = %slot_id, "Slot advertised idle twice; ignoring duplicate token");
        }
        inserted
    }

    /// Remove a slot's token. Exactly one of any concurrent callers for the
    /// same present token gets `true`.
    pub fn try_withdraw(&self, slot_id: &str) -> bool {
        self.lock().remove(slot_id)
    }

    /// Remove a slot's token and run `claim` under the same lock.
    pub fn withdraw_with<T>(&self, slot_id: &str, claim: impl FnOnce() -> T) -> T {
        let mut idle = self.lock();
        idle.remove(slot_id);
        claim()
    }

    /// Idle slot count together with `read`, both under the pool lock.
    /// A claim made through `withdraw_with` is either fully visible or
    /// not at all.
    pub fn free_count_with<T>(&self, read: impl FnOnce() -> T) -> (usize, T) {
        let idle = self.lock();
        (idle.len(), read())
    }

    pub fn free_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.idle.lock().unwrap_or_else(|e| e.into_inner())
    }
}
