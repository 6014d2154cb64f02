//! An open-addressing set of addresses, used to track which blocks a
//! [`DiagnosticAllocator`](super::diagnostic::DiagnosticAllocator) has handed
//! out and which it has seen released.
//!
//! Slots are plain `usize`s. Two values are reserved and can never be stored:
//!
//! ```plaintext
//! 0           EMPTY      -- never written, terminates every probe
//! usize::MAX  TOMBSTONE  -- removed entry, probes walk over it
//! ```
//!
//! Removal leaves a tombstone behind so that probe chains running through the
//! removed slot stay intact. Tombstones are only cleared out by a rebuild,
//! which happens whenever `used` (live + tombstoned slots) reaches `max`
//! (half the capacity).

use std::{fmt, iter::FusedIterator, mem, slice};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::serialize::serde_usize::{self, AsUsize, FromUsize};

const EMPTY: usize = 0;
const TOMBSTONE: usize = usize::MAX;

/// An opaque, non-reserved address. A `Handle` is never `0` and never
/// `usize::MAX`, so it can always be stored in a [`PointerSet`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Handle(usize);

impl Handle {
    /// `None` for the two reserved sentinel values
    pub const fn new(addr: usize) -> Option<Self> {
        if addr == EMPTY || addr == TOMBSTONE {
            None
        } else {
            Some(Self(addr))
        }
    }

    pub fn from_ptr<T>(ptr: *const T) -> Option<Self> {
        Self::new(ptr as usize)
    }

    pub const fn addr(self) -> usize {
        self.0
    }

    pub fn as_ptr(self) -> *mut u8 {
        self.0 as *mut u8
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl AsUsize for Handle {
    fn as_usize(self) -> usize {
        self.0
    }
}

impl FromUsize for Handle {
    fn from_usize(value: usize) -> Option<Self> {
        Self::new(value)
    }
}

impl Serialize for Handle {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serde_usize::serialize(self, serializer)
    }
}

impl<'de> Deserialize<'de> for Handle {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        serde_usize::deserialize(deserializer)
    }
}

// MurmurHash3 finalizers
#[allow(dead_code)]
const fn avalanche32(mut h: u32) -> u32 {
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}

#[allow(dead_code)]
const fn avalanche64(mut h: u64) -> u64 {
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51_afd7_ed55_8ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    h ^= h >> 33;
    h
}

/// Spread the bits of an address, using the finalizer that matches the
/// platform pointer width.
#[cfg(target_pointer_width = "64")]
pub const fn hash(handle: Handle) -> usize {
    avalanche64(handle.0 as u64) as usize
}

#[cfg(not(target_pointer_width = "64"))]
pub const fn hash(handle: Handle) -> usize {
    avalanche32(handle.0 as u32) as usize
}

/// A growing hash set of [`Handle`]s with linear probing and tombstone
/// deletion.
///
/// # Invariants
///
/// - `slots.len()` is `mask + 1` and a power of two (or `0` before the first
///   insertion)
/// - `count <= used <= max <= (mask + 1) / 2` between operations, so there
///   is always at least one `EMPTY` slot and every probe terminates
pub struct PointerSet {
    /// Live entries
    count: usize,
    /// Live and tombstoned entries
    used: usize,
    /// Once `used` reaches this, the next insertion rebuilds first
    max: usize,
    mask: usize,
    slots: Vec<usize>,
}

impl PointerSet {
    pub const fn new() -> Self {
        Self {
            count: 0,
            used: 0,
            max: 0,
            mask: 0,
            slots: Vec::new(),
        }
    }

    /// Number of live handles
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Number of occupied slots, live or tombstoned
    pub fn used(&self) -> usize {
        self.used
    }

    /// Number of slots
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Insert `handle`. Returns `false` (and changes nothing) if it was already
    /// present.
    pub fn add(&mut self, handle: Handle) -> bool {
        if self.used >= self.max {
            self.grow();
        }
        self.insert(handle)
    }

    /// Look `handle` up, returning the stored copy
    pub fn get(&self, handle: Handle) -> Option<Handle> {
        self.find(handle).map(|_| handle)
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.find(handle).is_some()
    }

    /// Remove `handle`, leaving a tombstone in its slot. `used` is unchanged.
    /// Returns `false` if `handle` was not present.
    pub fn remove(&mut self, handle: Handle) -> bool {
        match self.find(handle) {
            Some(i) => {
                debug_assert!(self.count > 0);
                self.slots[i] = TOMBSTONE;
                self.count -= 1;
                true
            }
            None => false,
        }
    }

    /// Drop every entry and release the storage
    pub fn clear(&mut self) {
        *self = Self::new();
    }

    /// Rebuild at the current capacity, discarding all tombstones
    pub fn rehash(&mut self) {
        if !self.slots.is_empty() {
            self.rebuild(self.slots.len());
        }
    }

    /// Walk the live handles in slot order. The borrow keeps the set from
    /// being mutated for as long as the walk lasts.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            slots: self.slots.iter(),
        }
    }

    fn start(&self, handle: Handle) -> usize {
        hash(handle) & self.mask
    }

    fn find(&self, handle: Handle) -> Option<usize> {
        if self.slots.is_empty() {
            return None;
        }
        let mut i = self.start(handle);
        loop {
            match self.slots[i] {
                EMPTY => return None,
                q if q == handle.0 => return Some(i),
                _ => i = (i + 1) & self.mask,
            }
        }
    }

    /// Probe to the end of the chain so that a copy of `handle` sitting behind
    /// a tombstone is still seen as a duplicate, then reuse the first
    /// tombstone on the way if there was one.
    fn insert(&mut self, handle: Handle) -> bool {
        debug_assert!(self.used < self.max);

        let mut first_tombstone = None;
        let mut i = self.start(handle);
        loop {
            match self.slots[i] {
                EMPTY => break,
                TOMBSTONE => {
                    first_tombstone.get_or_insert(i);
                }
                q if q == handle.0 => return false,
                _ => {}
            }
            i = (i + 1) & self.mask;
        }

        match first_tombstone {
            Some(t) => {
                // already counted in `used`
                self.slots[t] = handle.0;
                self.count += 1;
            }
            None => {
                self.slots[i] = handle.0;
                self.count += 1;
                self.used += 1;
            }
        }
        true
    }

    /// Insert into a table known to contain neither `handle` nor tombstones.
    fn insert_fresh(&mut self, handle: Handle) {
        let mut i = self.start(handle);
        while self.slots[i] != EMPTY {
            i = (i + 1) & self.mask;
        }
        self.slots[i] = handle.0;
        self.count += 1;
        self.used += 1;
    }

    fn grow(&mut self) {
        let size = self.mask + 1;
        // only double if the live entries alone would keep the table busy,
        // otherwise a same-size rebuild is enough to flush the tombstones
        let new_size = if self.count * 2 > self.max {
            size * 2
        } else {
            size
        };
        self.rebuild(new_size.max(2));
    }

    fn rebuild(&mut self, new_size: usize) {
        debug_assert!(new_size.is_power_of_two());

        let old = mem::replace(&mut self.slots, vec![EMPTY; new_size]);
        self.count = 0;
        self.used = 0;
        self.mask = new_size - 1;
        self.max = new_size - (new_size >> 1);

        for &slot in old.iter() {
            if let Some(handle) = Handle::new(slot) {
                self.insert_fresh(handle);
            }
        }

        debug_assert!(self.count <= self.max);
        debug_assert!(self.used < self.max);
        debug_assert!(self.max <= self.mask + 1);
    }
}

impl Default for PointerSet {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PointerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl<'a> IntoIterator for &'a PointerSet {
    type Item = Handle;
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Lazy walk over the live handles of a [`PointerSet`]
pub struct Iter<'a> {
    slots: slice::Iter<'a, usize>,
}

impl Iterator for Iter<'_> {
    type Item = Handle;

    fn next(&mut self) -> Option<Handle> {
        self.slots.by_ref().find_map(|&slot| Handle::new(slot))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.slots.len()))
    }
}

impl FusedIterator for Iter<'_> {}

#[cfg(test)]
mod tests {
    use hashbrown::HashSet;
    use proptest::prelude::*;

    use super::*;

    fn h(addr: usize) -> Handle {
        Handle::new(addr).unwrap()
    }

    fn check_invariants(set: &PointerSet) {
        assert!(set.count <= set.used);
        if !set.slots.is_empty() {
            assert!(set.used <= set.max);
            assert!(set.max <= set.mask + 1);
            assert_eq!(set.slots.len(), set.mask + 1);
            assert!(set.slots.len().is_power_of_two());
        }
        assert_eq!(set.iter().count(), set.count);
        let tombstones = set.slots.iter().filter(|&&s| s == TOMBSTONE).count();
        assert_eq!(set.count + tombstones, set.used);
    }

    #[test]
    fn sentinels_are_not_handles() {
        assert!(Handle::new(0).is_none());
        assert!(Handle::new(usize::MAX).is_none());
        assert_eq!(Handle::new(0x1000).map(Handle::addr), Some(0x1000));
    }

    #[test]
    fn empty_set_finds_nothing() {
        let mut set = PointerSet::new();
        assert!(!set.contains(h(8)));
        assert!(!set.remove(h(8)));
        assert_eq!(set.iter().next(), None);
        assert_eq!(set.capacity(), 0);
    }

    #[test]
    fn first_insertion_allocates_minimum_capacity() {
        let mut set = PointerSet::new();
        assert!(set.add(h(0x10)));
        assert_eq!(set.capacity(), 2);
        assert_eq!(set.len(), 1);
        check_invariants(&set);
    }

    #[test]
    fn add_remove_get() {
        let mut set = PointerSet::new();
        set.add(h(0x40));
        assert_eq!(set.get(h(0x40)), Some(h(0x40)));
        assert!(set.remove(h(0x40)));
        assert_eq!(set.get(h(0x40)), None);
        assert_eq!(set.len(), 0);
        assert_eq!(set.used(), 1);
        check_invariants(&set);
    }

    #[test]
    fn add_twice_reports_already_present() {
        let mut set = PointerSet::new();
        assert!(set.add(h(0x20)));
        assert!(!set.add(h(0x20)));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn insertion_into_tombstone_only_bumps_count() {
        let mut set = PointerSet::new();
        for a in 1..=16 {
            set.add(h(a * 16));
        }
        set.remove(h(16));
        let (count, used) = (set.len(), set.used());
        // same address hashes to the same chain, so it lands on its tombstone
        set.add(h(16));
        assert_eq!(set.len(), count + 1);
        assert_eq!(set.used(), used);
        check_invariants(&set);
    }

    #[test]
    fn duplicate_behind_tombstone_is_detected() {
        let mut set = PointerSet::new();
        for a in 1..=64 {
            set.add(h(a * 8));
        }
        // tombstone every other entry, then re-add all of them: every add of a
        // still-live handle must report a duplicate no matter where the
        // tombstones ended up in its chain
        for a in (1..=64).step_by(2) {
            set.remove(h(a * 8));
        }
        for a in (2..=64).step_by(2) {
            assert!(!set.add(h(a * 8)));
        }
        assert_eq!(set.len(), 32);
        check_invariants(&set);
    }

    #[test]
    fn tombstones_do_not_end_lookups() {
        let mut set = PointerSet::new();
        let handles: Vec<_> = (1..=200).map(|a| h(a * 24)).collect();
        for &p in &handles {
            set.add(p);
        }
        for &p in handles.iter().step_by(3) {
            set.remove(p);
        }
        for (i, &p) in handles.iter().enumerate() {
            assert_eq!(set.contains(p), i % 3 != 0, "{p:?}");
        }
        check_invariants(&set);
    }

    #[test]
    fn churn_rebuilds_without_doubling() {
        let mut set = PointerSet::new();
        for a in 1..=8 {
            set.add(h(a * 16));
        }
        for a in 9..100 {
            set.add(h(a * 16));
            set.remove(h(a * 16));
        }
        let capacity = set.capacity();
        // a small live population cycling through fresh addresses fills the
        // table with tombstones; the rebuilds must not keep doubling
        for a in 100..5000 {
            set.add(h(a * 16));
            set.remove(h(a * 16));
        }
        assert_eq!(set.capacity(), capacity);
        assert_eq!(set.len(), 8);
        check_invariants(&set);
    }

    #[test]
    fn rehash_preserves_members_and_clears_tombstones() {
        let mut set = PointerSet::new();
        for a in 1..=100 {
            set.add(h(a * 32));
        }
        for a in (1..=100).filter(|a| a % 4 == 0) {
            set.remove(h(a * 32));
        }
        let before: HashSet<Handle> = set.iter().collect();
        let capacity = set.capacity();

        set.rehash();

        let after: HashSet<Handle> = set.iter().collect();
        assert_eq!(before, after);
        assert_eq!(set.capacity(), capacity);
        assert_eq!(set.used(), set.len());
        check_invariants(&set);
    }

    #[test]
    fn clear_releases_storage() {
        let mut set = PointerSet::new();
        set.add(h(0x1234));
        set.clear();
        assert!(set.is_empty());
        assert_eq!(set.capacity(), 0);
        assert!(!set.contains(h(0x1234)));
    }

    #[test]
    fn handle_serializes_as_integer() {
        let json = serde_json::to_string(&h(0xbeef)).unwrap();
        assert_eq!(json, "48879");
        let back: Handle = serde_json::from_str(&json).unwrap();
        assert_eq!(back, h(0xbeef));
        assert!(serde_json::from_str::<Handle>("0").is_err());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Add(usize),
        Remove(usize),
        Rehash,
    }

    fn op() -> impl Strategy<Value = Op> {
        // a narrow address range so that removals and duplicates actually hit
        let addr = (1usize..512).prop_map(|a| a * 8);
        prop_oneof![
            6 => addr.clone().prop_map(Op::Add),
            3 => addr.prop_map(Op::Remove),
            1 => Just(Op::Rehash),
        ]
    }

    proptest! {
        #[test]
        fn behaves_like_a_set(ops in proptest::collection::vec(op(), 0..600)) {
            let mut set = PointerSet::new();
            let mut oracle = HashSet::new();
            for op in ops {
                match op {
                    Op::Add(a) => prop_assert_eq!(set.add(h(a)), oracle.insert(a)),
                    Op::Remove(a) => prop_assert_eq!(set.remove(h(a)), oracle.remove(&a)),
                    Op::Rehash => set.rehash(),
                }
                prop_assert_eq!(set.len(), oracle.len());
            }
            let members: HashSet<usize> = set.iter().map(Handle::addr).collect();
            prop_assert_eq!(members, oracle);
            check_invariants(&set);
        }

        #[test]
        fn add_then_remove_then_get_is_absent(addrs in proptest::collection::vec(1usize..usize::MAX, 1..100)) {
            let mut set = PointerSet::new();
            for &a in &addrs {
                set.add(h(a));
            }
            for &a in &addrs {
                set.remove(h(a));
                prop_assert!(set.get(h(a)).is_none());
            }
            prop_assert!(set.is_empty());
        }
    }
}
