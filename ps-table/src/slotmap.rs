//! The fixed-slot sharded ordered map backing `SparseTable`.
//!
//! Generalized from `dataflow-state/src/keyed_state.rs`'s per-index-type map
//! enum into a fixed-`S`-slot array so pushes and pulls against different
//! slots make progress concurrently, while each slot still offers the
//! shared/unique locking discipline the table engine's push/pull/insert
//! paths need. Ordering within a slot uses `crossbeam_skiplist::SkipMap`,
//! already present in the dependency set, so a slot's keys can be walked in
//! order for transfer batching without a separate sort step. The outer
//! `parking_lot::RwLock` per slot is what actually serializes writers here;
//! a write-locked slot is only ever touched by its lock holder, so mutating
//! a row is a plain clone-modify-reinsert rather than needing the skip
//! list's own lock-free CAS path.

use crossbeam_skiplist::SkipMap;
use parking_lot::RwLock;

/// Number of shards a table's rows are split across for concurrent access.
/// Fixed; unrelated to cluster shard count (that's the routing ring).
pub const SLOT_COUNT: usize = 16;

/// `S` independently-lockable ordered maps. Keys are distributed across
/// slots by `key % SLOT_COUNT`, not by the cluster's consistent-hash ring.
pub struct SlottedMap<V> {
    slots: Vec<RwLock<SkipMap<u64, V>>>,
}

impl<V: Clone + Send + 'static> Default for SlottedMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone + Send + 'static> SlottedMap<V> {
    pub fn new() -> Self {
        SlottedMap {
            slots: (0..SLOT_COUNT).map(|_| RwLock::new(SkipMap::new())).collect(),
        }
    }

    pub fn slot_of(key: u64) -> usize {
        (key % SLOT_COUNT as u64) as usize
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Group keys by the slot they fall in, preserving input order within
    /// each group. Used by `push`/`pull` to take one lock per touched slot
    /// rather than one lock per key.
    pub fn group_by_slot<'a, T>(
        items: &'a [T],
        key_of: impl Fn(&T) -> u64,
    ) -> Vec<(usize, Vec<&'a T>)> {
        let mut grouped: Vec<(usize, Vec<&T>)> = Vec::new();
        for item in items {
            let slot = Self::slot_of(key_of(item));
            match grouped.iter_mut().find(|(s, _)| *s == slot) {
                Some((_, v)) => v.push(item),
                None => grouped.push((slot, vec![item])),
            }
        }
        grouped
    }

    /// Run `f` with a single shared lock over the whole slot containing
    /// `slot_idx`'s keys. Lets a caller apply a batch of reads (or writes,
    /// via [`SlottedMap::with_slot_write`]) under one lock acquisition
    /// instead of one per key, matching the table engine's per-slot-lock
    /// push/pull discipline.
    pub fn with_slot_read<R>(&self, slot_idx: usize, f: impl FnOnce(&SkipMap<u64, V>) -> R) -> R {
        f(&self.slots[slot_idx].read())
    }

    /// Write-locked counterpart of [`SlottedMap::with_slot_read`].
    pub fn with_slot_write<R>(&self, slot_idx: usize, f: impl FnOnce(&SkipMap<u64, V>) -> R) -> R {
        f(&self.slots[slot_idx].write())
    }

    pub fn contains(&self, key: u64) -> bool {
        self.slots[Self::slot_of(key)].read().contains_key(&key)
    }

    /// Read `key` under the slot's shared lock, without creating it.
    /// Pull paths use this; a miss never inserts.
    pub fn get(&self, key: u64) -> Option<V> {
        let slot = self.slots[Self::slot_of(key)].read();
        slot.get(&key).map(|e| e.value().clone())
    }

    /// Fetch-or-create-then-mutate `key` under the slot's unique lock, used
    /// by push paths: `make` runs only on first touch, `f` always runs.
    pub fn update_or_insert(&self, key: u64, make: impl FnOnce() -> V, f: impl FnOnce(&mut V)) {
        let slot = self.slots[Self::slot_of(key)].write();
        let mut v = slot.get(&key).map(|e| e.value().clone()).unwrap_or_else(make);
        f(&mut v);
        slot.insert(key, v);
    }

    /// Insert `value` only if `key` is absent (first-insert-wins, used by
    /// transfer and proxy-fetch races).
    pub fn insert_if_absent(&self, key: u64, value: V) {
        let slot = self.slots[Self::slot_of(key)].write();
        if slot.get(&key).is_none() {
            slot.insert(key, value);
        }
    }

    /// Remove every key in slot `slot_idx` for which `keep` returns false.
    /// Used by the donor's post-transfer clean-up pass.
    pub fn retain_slot(&self, slot_idx: usize, keep: impl Fn(u64) -> bool) {
        let slot = self.slots[slot_idx].write();
        let doomed: Vec<u64> = slot
            .iter()
            .filter(|e| !keep(*e.key()))
            .map(|e| *e.key())
            .collect();
        for k in doomed {
            slot.remove(&k);
        }
    }

    /// Copy up to `batch_size` `(key, value)` pairs from slot `slot_idx`
    /// whose key is `>= cursor`, for transfer batching.
    pub fn batch_from(&self, slot_idx: usize, cursor: u64, batch_size: usize) -> Vec<(u64, V)> {
        let slot = self.slots[slot_idx].read();
        slot.range(cursor..)
            .take(batch_size)
            .map(|e| (*e.key(), e.value().clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_of_is_stable_and_bounded() {
        for k in [0u64, 1, 15, 16, 17, u64::MAX] {
            assert!(SlottedMap::<i32>::slot_of(k) < SLOT_COUNT);
        }
        assert_eq!(SlottedMap::<i32>::slot_of(0), SlottedMap::<i32>::slot_of(16));
    }

    #[test]
    fn update_or_insert_creates_then_mutates() {
        let m: SlottedMap<i32> = SlottedMap::new();
        m.update_or_insert(5, || 0, |v| *v += 1);
        assert_eq!(m.get(5), Some(1));
        m.update_or_insert(5, || 0, |v| *v += 1);
        assert_eq!(m.get(5), Some(2));
    }

    #[test]
    fn insert_if_absent_is_first_write_wins() {
        let m: SlottedMap<i32> = SlottedMap::new();
        m.insert_if_absent(1, 10);
        m.insert_if_absent(1, 20);
        assert_eq!(m.get(1), Some(10));
    }

    #[test]
    fn retain_slot_drops_unwanted_keys() {
        let m: SlottedMap<i32> = SlottedMap::new();
        m.insert_if_absent(1, 1);
        m.insert_if_absent(17, 2);
        let slot = SlottedMap::<i32>::slot_of(1);
        assert_eq!(slot, SlottedMap::<i32>::slot_of(17));
        m.retain_slot(slot, |k| k != 1);
        assert_eq!(m.get(1), None);
        assert_eq!(m.get(17), Some(2));
    }
}
