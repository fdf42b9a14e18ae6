//! Striped per-key reader-writer locks
//!
//! Unlike a guard-based `RwLock`, acquisition and release are explicit calls,
//! so a distributed transaction can take key locks in its prepare phase and
//! release them in commit or rollback. Keys hash onto a fixed set of slots;
//! slots are always acquired in ascending index order, which prevents
//! deadlock between overlapping multi-key lock sets.

use parking_lot::{Condvar, Mutex};
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

#[derive(Default)]
struct SlotState {
    readers: usize,
    writer: bool,
}

struct Slot {
    state: Mutex<SlotState>,
    cond: Condvar,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::default()),
            cond: Condvar::new(),
        }
    }

    fn lock_write(&self) {
        let mut state = self.state.lock();
        while state.writer || state.readers > 0 {
            self.cond.wait(&mut state);
        }
        state.writer = true;
    }

    fn lock_read(&self) {
        let mut state = self.state.lock();
        while state.writer {
            self.cond.wait(&mut state);
        }
        state.readers += 1;
    }

    fn unlock_write(&self) {
        let mut state = self.state.lock();
        state.writer = false;
        self.cond.notify_all();
    }

    fn unlock_read(&self) {
        let mut state = self.state.lock();
        state.readers = state.readers.saturating_sub(1);
        self.cond.notify_all();
    }
}

/// Striped lock map over key space.
pub struct LockMap {
    slots: Vec<Slot>,
}

impl LockMap {
    pub fn new(slot_count: usize) -> Self {
        assert!(slot_count > 0);
        Self {
            slots: (0..slot_count).map(|_| Slot::new()).collect(),
        }
    }

    fn slot_index(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.slots.len()
    }

    /// Deduplicated slot set for a lock request. When a write key and a read
    /// key share a slot, the write lock wins.
    fn slot_plan(&self, write_keys: &[String], read_keys: &[String]) -> BTreeMap<usize, bool> {
        let mut plan = BTreeMap::new();
        for key in read_keys {
            plan.insert(self.slot_index(key), false);
        }
        for key in write_keys {
            plan.insert(self.slot_index(key), true);
        }
        plan
    }

    /// Acquire write locks on `write_keys` and read locks on `read_keys`.
    ///
    /// Blocks until all involved slots are held. Must be paired with exactly
    /// one [`LockMap::rw_unlocks`] with the same key sets.
    pub fn rw_locks(&self, write_keys: &[String], read_keys: &[String]) {
        for (idx, write) in self.slot_plan(write_keys, read_keys) {
            if write {
                self.slots[idx].lock_write();
            } else {
                self.slots[idx].lock_read();
            }
        }
    }

    /// Release locks taken by [`LockMap::rw_locks`].
    pub fn rw_unlocks(&self, write_keys: &[String], read_keys: &[String]) {
        for (idx, write) in self.slot_plan(write_keys, read_keys).into_iter().rev() {
            if write {
                self.slots[idx].unlock_write();
            } else {
                self.slots[idx].unlock_read();
            }
        }
    }
}
