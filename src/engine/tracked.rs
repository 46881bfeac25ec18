//! Membership set for tree-following mode
//!
//! A fixed-capacity open-addressing set of thread-group ids, the userspace
//! counterpart of a `BPF_MAP_TYPE_HASH` with `max_entries`. Fork and exit
//! hooks may run for different processors at the same time, so slots are
//! claimed and released with compare-and-swap; lookups are plain loads.
//!
//! Slot states: `EMPTY` (never used, ends a probe chain), `TOMBSTONE`
//! (released, skipped by lookups and reused by inserts) or a live tgid.
//! A given tgid is inserted by exactly one fork event, so two inserts of
//! the same id never race.

use std::hash::Hasher;
use std::sync::atomic::{AtomicU32, Ordering};

use fnv::FnvHasher;

const EMPTY: u32 = 0;
const TOMBSTONE: u32 = u32::MAX;

/// Default number of slots, enough for large build trees
pub const DEFAULT_TRACKED_CAPACITY: usize = 8192;

/// Insertion failed because every slot is live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackedSetFull;

#[derive(Debug)]
pub struct TrackedSet {
    slots: Box<[AtomicU32]>,
    mask: usize,
}

impl TrackedSet {
    /// Create a set with at least `capacity` slots (rounded up to a power
    /// of two, minimum 2)
    pub fn with_capacity(capacity: usize) -> Self {
        let size = capacity.max(2).next_power_of_two();
        let slots = (0..size)
            .map(|_| AtomicU32::new(EMPTY))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            mask: size - 1,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn home(&self, tgid: u32) -> usize {
        let mut hasher = FnvHasher::default();
        hasher.write_u32(tgid);
        hasher.finish() as usize & self.mask
    }

    /// Probe sequence starting at the home slot, visiting every slot once
    fn probe(&self, tgid: u32) -> impl Iterator<Item = &AtomicU32> {
        let start = self.home(tgid);
        (0..self.slots.len()).map(move |i| &self.slots[(start + i) & self.mask])
    }

    pub fn contains(&self, tgid: u32) -> bool {
        if tgid == EMPTY || tgid == TOMBSTONE {
            return false;
        }
        for slot in self.probe(tgid) {
            match slot.load(Ordering::Acquire) {
                EMPTY => return false,
                current if current == tgid => return true,
                _ => {}
            }
        }
        false
    }

    /// Add `tgid`. Returns `Ok(true)` if it was newly inserted, `Ok(false)`
    /// if it was already present or is not a valid id.
    pub fn insert(&self, tgid: u32) -> Result<bool, TrackedSetFull> {
        if tgid == EMPTY || tgid == TOMBSTONE {
            return Ok(false);
        }
        if self.contains(tgid) {
            return Ok(false);
        }
        for slot in self.probe(tgid) {
            let mut current = slot.load(Ordering::Acquire);
            while current == EMPTY || current == TOMBSTONE {
                match slot.compare_exchange(current, tgid, Ordering::AcqRel, Ordering::Acquire) {
                    Ok(_) => return Ok(true),
                    Err(actual) => current = actual,
                }
            }
        }
        Err(TrackedSetFull)
    }

    /// Remove `tgid`. Returns whether it was present.
    pub fn remove(&self, tgid: u32) -> bool {
        if tgid == EMPTY || tgid == TOMBSTONE {
            return false;
        }
        for slot in self.probe(tgid) {
            match slot.load(Ordering::Acquire) {
                EMPTY => return false,
                current if current == tgid => {
                    return slot
                        .compare_exchange(tgid, TOMBSTONE, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok();
                }
                _ => {}
            }
        }
        false
    }

    /// Live members, in slot order
    pub fn members(&self) -> Vec<u32> {
        self.slots
            .iter()
            .map(|slot| slot.load(Ordering::Acquire))
            .filter(|&v| v != EMPTY && v != TOMBSTONE)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.members().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_contains_remove() {
        let set = TrackedSet::with_capacity(16);
        assert_eq!(set.insert(100), Ok(true));
        assert!(set.contains(100));
        assert!(!set.contains(101));
        assert!(set.remove(100));
        assert!(!set.contains(100));
        assert!(!set.remove(100));
    }

    #[test]
    fn test_duplicate_insert() {
        let set = TrackedSet::with_capacity(16);
        assert_eq!(set.insert(5), Ok(true));
        assert_eq!(set.insert(5), Ok(false));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_reserved_ids_are_rejected() {
        let set = TrackedSet::with_capacity(4);
        assert_eq!(set.insert(0), Ok(false));
        assert_eq!(set.insert(u32::MAX), Ok(false));
        assert!(!set.contains(0));
        assert!(set.is_empty());
    }

    #[test]
    fn test_capacity_rounds_up() {
        assert_eq!(TrackedSet::with_capacity(5).capacity(), 8);
        assert_eq!(TrackedSet::with_capacity(0).capacity(), 2);
    }

    #[test]
    fn test_full_set() {
        let set = TrackedSet::with_capacity(4);
        for tgid in 1..=4 {
            assert_eq!(set.insert(tgid), Ok(true));
        }
        assert_eq!(set.insert(5), Err(TrackedSetFull));
        assert!(set.remove(2));
        assert_eq!(set.insert(5), Ok(true));
        assert!(set.contains(5));
        for tgid in [1, 3, 4] {
            assert!(set.contains(tgid));
        }
    }

    #[test]
    fn test_lookup_skips_tombstones() {
        let set = TrackedSet::with_capacity(8);
        for tgid in 1..=6 {
            set.insert(tgid).unwrap();
        }
        for tgid in 1..=5 {
            assert!(set.remove(tgid));
        }
        assert!(set.contains(6));
        assert_eq!(set.members(), vec![6]);
    }

    #[test]
    fn test_concurrent_inserts_of_distinct_ids() {
        let set = TrackedSet::with_capacity(1024);
        std::thread::scope(|s| {
            for t in 0..4u32 {
                let set = &set;
                s.spawn(move || {
                    for i in 0..200u32 {
                        set.insert(1 + t * 1000 + i).unwrap();
                    }
                });
            }
        });
        assert_eq!(set.len(), 800);
        assert!(set.contains(1));
        assert!(set.contains(3000 + 200));
    }
}
