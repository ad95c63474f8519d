//! Process-wide address allocation for concurrent environments
//!
//! Every live environment holds a [`Slot`]: a simulator its port, a cluster
//! the third octet of its node addresses. A slot returns to its pool when
//! the environment holding it is dropped, so two environments alive at the
//! same time never share an address.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};

/// A contiguous range of slot numbers handed out one at a time
#[derive(Debug, Clone)]
pub struct SlotPool {
    first: u32,
    len: u32,
    taken: Arc<Mutex<BTreeSet<u32>>>,
}

impl SlotPool {
    pub fn new(first: u32, len: u32) -> Self {
        Self {
            first,
            len,
            taken: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    /// Claim the lowest free slot.
    pub fn claim(&self) -> Option<Slot> {
        self.claim_where(|_| true)
    }

    /// Claim the lowest free slot that `usable` accepts. Slots rejected by
    /// `usable` stay free for later claims.
    pub fn claim_where(&self, usable: impl Fn(u32) -> bool) -> Option<Slot> {
        let mut taken = self.lock();
        let value = (self.first..self.first.saturating_add(self.len))
            .find(|value| !taken.contains(value) && usable(*value))?;
        taken.insert(value);
        Some(Slot {
            value,
            taken: self.taken.clone(),
        })
    }

    /// Slots currently held.
    pub fn in_use(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeSet<u32>> {
        self.taken.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// One claimed slot. Released on drop.
#[derive(Debug)]
pub struct Slot {
    value: u32,
    taken: Arc<Mutex<BTreeSet<u32>>>,
}

impl Slot {
    pub fn value(&self) -> u32 {
        self.value
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        let mut taken = self.taken.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        taken.remove(&self.value);
    }
}
