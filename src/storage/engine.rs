//! Store: entries, key index and expiry heap behind one lock
//!
//! This module implements the synchronous core of the timed map. A [`Store`]
//! is never shared directly; [`TimedMap`](crate::TimedMap) keeps it inside a
//! single `RwLock` so the map and the heap always change together.
//!
//! ## Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                            Store                             │
//! │                                                              │
//! │   index: HashMap<K, EntryId>      entries: SlotMap<EntryId>  │
//! │   ┌───────┬────────┐             ┌──────────────────────────┐ │
//! │   │ "a"   │ id 3   │ ──────────> │ key, value, expiry,      │ │
//! │   │ "b"   │ id 1   │             │ heap_pos: Some(0)        │ │
//! │   └───────┴────────┘             └──────────────────────────┘ │
//! │                                              ▲               │
//! │   heap: ExpiryHeap<EntryId>  [ id3, id7, ... ]               │
//! │                                                              │
//! │   counters: added / removed / expired / permanent            │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! An entry is in the heap exactly when its expiry is [`Expiry::At`].
//! Counters are bumped in the same `&mut self` call as the change they
//! describe, so a [`Stats`] read under the lock is always self-consistent.

use crate::storage::heap::{ExpiryHeap, HeapItem};
use slotmap::{new_key_type, SlotMap};
use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;
use std::ops::ControlFlow;
use std::time::Duration;
use tokio::time::Instant;

new_key_type! {
    /// Arena handle of a stored entry.
    pub(crate) struct EntryId;
}

/// When an entry stops being live.
///
/// The derived ordering places every `At` before `Permanent`, and orders
/// `At` values by instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Expiry {
    /// Expires at this instant on the monotonic clock.
    At(Instant),
    /// Never expires.
    Permanent,
}

impl Expiry {
    /// Expiry `ttl` from now.
    ///
    /// A zero TTL means [`Expiry::Permanent`], and so does a TTL too large
    /// for the monotonic clock to represent (such as `Duration::MAX`).
    pub fn after(ttl: Duration) -> Self {
        if ttl.is_zero() {
            return Expiry::Permanent;
        }
        Instant::now()
            .checked_add(ttl)
            .map_or(Expiry::Permanent, Expiry::At)
    }

    /// Returns `true` for [`Expiry::Permanent`].
    #[inline]
    pub fn is_permanent(&self) -> bool {
        matches!(self, Expiry::Permanent)
    }

    /// The expiration instant, or `None` if permanent.
    #[inline]
    pub fn instant(&self) -> Option<Instant> {
        match self {
            Expiry::At(at) => Some(*at),
            Expiry::Permanent => None,
        }
    }

    /// Returns `true` if the expiry is at or before `now`.
    #[inline]
    pub fn is_due(&self, now: Instant) -> bool {
        match self {
            Expiry::At(at) => *at <= now,
            Expiry::Permanent => false,
        }
    }

    /// Time left before expiry, saturating at zero. `None` if permanent.
    pub fn remaining(&self) -> Option<Duration> {
        self.instant()
            .map(|at| at.saturating_duration_since(Instant::now()))
    }
}

impl From<Instant> for Expiry {
    fn from(at: Instant) -> Self {
        Expiry::At(at)
    }
}

impl From<std::time::Instant> for Expiry {
    fn from(at: std::time::Instant) -> Self {
        Expiry::At(Instant::from_std(at))
    }
}

/// A stored key/value pair.
#[derive(Debug)]
pub(crate) struct Entry<K, V> {
    key: K,
    value: V,
    expiry: Expiry,
    /// Slot in the expiry heap; `None` for permanent entries.
    heap_pos: Option<usize>,
}

impl<K, V> HeapItem for Entry<K, V> {
    #[inline]
    fn expiry(&self) -> Expiry {
        self.expiry
    }

    #[inline]
    fn heap_pos(&self) -> Option<usize> {
        self.heap_pos
    }

    #[inline]
    fn set_heap_pos(&mut self, pos: Option<usize>) {
        self.heap_pos = pos;
    }
}

/// Map statistics, read as one consistent snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Keys inserted for the first time
    pub added: u64,
    /// Keys deleted by `remove` or by `set_expiry` with a past instant
    pub removed: u64,
    /// Keys deleted by the reaper
    pub expired: u64,
    /// Times a key became permanent (on insert or by conversion)
    pub permanent: u64,
    /// Live keys at the time of the read
    pub current: u64,
}

#[derive(Debug, Default)]
struct Counters {
    added: u64,
    removed: u64,
    expired: u64,
    permanent: u64,
}

/// Whether a mutation may have moved the heap minimum earlier.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Signal {
    /// The reaper's current deadline is still correct.
    Quiet,
    /// The reaper must recompute its deadline.
    Wake,
}

/// Key → entry storage paired with the expiry heap.
#[derive(Debug)]
pub(crate) struct Store<K, V> {
    entries: SlotMap<EntryId, Entry<K, V>>,
    index: HashMap<K, EntryId>,
    heap: ExpiryHeap<EntryId>,
    counters: Counters,
}

impl<K, V> Default for Store<K, V>
where
    K: Hash + Eq + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Store<K, V>
where
    K: Hash + Eq + Clone,
{
    pub(crate) fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Empty store with room for `capacity` entries before reallocating.
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: SlotMap::with_capacity_and_key(capacity),
            index: HashMap::with_capacity(capacity),
            heap: ExpiryHeap::new(),
            counters: Counters::default(),
        }
    }

    #[cfg(test)]
    pub(crate) fn capacity(&self) -> usize {
        self.index.capacity().min(self.entries.capacity())
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.index.len()
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Number of entries with a finite expiry.
    #[inline]
    pub(crate) fn temporary_len(&self) -> usize {
        self.heap.len()
    }

    #[inline]
    fn lookup<Q>(&self, key: &Q) -> Option<EntryId>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.index.get(key).copied()
    }

    pub(crate) fn get<Q>(&self, key: &Q) -> Option<(&V, Expiry)>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let id = self.lookup(key)?;
        let entry = &self.entries[id];
        Some((&entry.value, entry.expiry))
    }

    pub(crate) fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.index.contains_key(key)
    }

    /// Takes `id` out of the heap if it is tracked. Returns `true` if it was.
    fn untrack(&mut self, id: EntryId) -> bool {
        match self.entries[id].heap_pos {
            Some(pos) => {
                let removed = self.heap.remove(pos, &mut self.entries);
                debug_assert_eq!(removed, Some(id), "heap_pos out of sync");
                true
            }
            None => false,
        }
    }

    /// Pushes or re-sifts `id` after its expiry was set to an instant.
    fn track(&mut self, id: EntryId) {
        match self.entries[id].heap_pos {
            Some(pos) => self.heap.fix(pos, &mut self.entries),
            None => self.heap.push(id, &mut self.entries),
        }
    }

    #[inline]
    fn signal_for(&self, id: EntryId) -> Signal {
        if self.heap.peek() == Some(id) {
            Signal::Wake
        } else {
            Signal::Quiet
        }
    }

    /// Inserts or updates `key` so that it never expires.
    pub(crate) fn set_permanent(&mut self, key: K, value: V) {
        match self.lookup(&key) {
            Some(id) => {
                if self.untrack(id) {
                    self.counters.permanent += 1;
                }
                let entry = &mut self.entries[id];
                entry.value = value;
                entry.expiry = Expiry::Permanent;
            }
            None => {
                let id = self.entries.insert(Entry {
                    key: key.clone(),
                    value,
                    expiry: Expiry::Permanent,
                    heap_pos: None,
                });
                self.index.insert(key, id);
                self.counters.added += 1;
                self.counters.permanent += 1;
            }
        }
    }

    /// Inserts or updates `key` with the given expiry.
    ///
    /// An existing temporary entry is re-sifted in place, an existing
    /// permanent entry is pushed into the heap.
    pub(crate) fn set_temporary(&mut self, key: K, value: V, expiry: Expiry) -> Signal {
        let Expiry::At(_) = expiry else {
            self.set_permanent(key, value);
            return Signal::Quiet;
        };

        let id = match self.lookup(&key) {
            Some(id) => {
                let entry = &mut self.entries[id];
                entry.value = value;
                entry.expiry = expiry;
                id
            }
            None => {
                let id = self.entries.insert(Entry {
                    key: key.clone(),
                    value,
                    expiry,
                    heap_pos: None,
                });
                self.index.insert(key, id);
                self.counters.added += 1;
                id
            }
        };
        self.track(id);
        self.signal_for(id)
    }

    /// Deletes `id` from every structure. Does not touch counters.
    fn unlink(&mut self, id: EntryId) -> Option<(K, V)> {
        self.untrack(id);
        let entry = self.entries.remove(id)?;
        self.index.remove(&entry.key);
        Some((entry.key, entry.value))
    }

    /// Removes `key`. Returns `true` if it was present.
    pub(crate) fn remove<Q>(&mut self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let Some(id) = self.lookup(key) else {
            return false;
        };
        let removed = self.unlink(id).is_some();
        if removed {
            self.counters.removed += 1;
        }
        removed
    }

    /// Drops every entry without touching the counters.
    pub(crate) fn remove_all(&mut self) {
        self.heap.clear();
        self.entries.clear();
        self.index.clear();
    }

    /// Stops `key` from expiring. Returns `false` if absent.
    pub(crate) fn make_permanent<Q>(&mut self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let Some(id) = self.lookup(key) else {
            return false;
        };
        if self.untrack(id) {
            self.entries[id].expiry = Expiry::Permanent;
            self.counters.permanent += 1;
        }
        true
    }

    /// Changes the expiry of an existing key.
    ///
    /// Returns `false` if the key is absent, or if `expiry` is at or before
    /// `now`: in that case the key is deleted on the spot and counted as
    /// removed. No expiration notification is produced for it.
    pub(crate) fn set_expiry<Q>(&mut self, key: &Q, expiry: Expiry, now: Instant) -> (bool, Signal)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let Some(id) = self.lookup(key) else {
            return (false, Signal::Quiet);
        };

        match expiry {
            Expiry::Permanent => (self.make_permanent(key), Signal::Quiet),
            Expiry::At(_) if expiry.is_due(now) => {
                if self.unlink(id).is_some() {
                    self.counters.removed += 1;
                }
                (false, Signal::Quiet)
            }
            Expiry::At(_) => {
                self.entries[id].expiry = expiry;
                self.track(id);
                (true, self.signal_for(id))
            }
        }
    }

    /// Earliest expiry among temporary entries.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.heap
            .peek()
            .and_then(|id| self.entries[id].expiry.instant())
    }

    /// Removes every entry due at `now`, in non-decreasing expiry order.
    pub(crate) fn pop_due(&mut self, now: Instant) -> Vec<(K, V)> {
        let mut due = Vec::new();
        while let Some(id) = self.heap.peek() {
            if !self.entries[id].expiry.is_due(now) {
                break;
            }
            self.heap.pop(&mut self.entries);
            if let Some(entry) = self.entries.remove(id) {
                self.index.remove(&entry.key);
                self.counters.expired += 1;
                due.push((entry.key, entry.value));
            }
        }
        due
    }

    /// Visits entries in arbitrary order until `f` breaks.
    pub(crate) fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&K, &V) -> ControlFlow<()>,
    {
        for entry in self.entries.values() {
            if f(&entry.key, &entry.value).is_break() {
                break;
            }
        }
    }

    pub(crate) fn keys(&self) -> Vec<K> {
        self.index.keys().cloned().collect()
    }

    pub(crate) fn snapshot(&self) -> HashMap<K, V>
    where
        V: Clone,
    {
        self.entries
            .values()
            .map(|entry| (entry.key.clone(), entry.value.clone()))
            .collect()
    }

    pub(crate) fn stats(&self) -> Stats {
        Stats {
            added: self.counters.added,
            removed: self.counters.removed,
            expired: self.counters.expired,
            permanent: self.counters.permanent,
            current: self.index.len() as u64,
        }
    }

    /// Exhaustive check of the store/heap invariants.
    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        assert_eq!(self.index.len(), self.entries.len());
        for (key, &id) in &self.index {
            let entry = &self.entries[id];
            assert!(entry.key == *key, "index points at a different key");
            assert_eq!(
                entry.heap_pos.is_some(),
                !entry.expiry.is_permanent(),
                "heap membership disagrees with expiry"
            );
        }
        self.heap.assert_consistent(&self.entries);
        let temporary = self
            .entries
            .values()
            .filter(|e| !e.expiry.is_permanent())
            .count();
        assert_eq!(self.heap.len(), temporary);
        let min = self.entries.values().filter_map(|e| e.expiry.instant()).min();
        assert_eq!(self.next_deadline(), min);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_set_and_get() {
        let mut store = Store::new();

        store.set_permanent("key".to_string(), "value");
        assert_eq!(store.get("key"), Some((&"value", Expiry::Permanent)));
        assert_eq!(store.len(), 1);
        store.assert_consistent();
    }

    #[test]
    fn test_get_nonexistent() {
        let store: Store<String, u32> = Store::new();
        assert_eq!(store.get("nonexistent"), None);
        assert!(!store.contains_key("nonexistent"));
    }

    #[test]
    fn test_update_keeps_single_entry() {
        let mut store = Store::new();
        let at = Instant::now() + ms(500);

        store.set_permanent("k", 1);
        let _ = store.set_temporary("k", 2, Expiry::At(at));
        let _ = store.set_temporary("k", 3, Expiry::At(at + ms(10)));

        assert_eq!(store.len(), 1);
        assert_eq!(store.get("k"), Some((&3, Expiry::At(at + ms(10)))));

        let stats = store.stats();
        assert_eq!(stats.added, 1);
        assert_eq!(stats.permanent, 1);
        store.assert_consistent();
    }

    #[test]
    fn test_permanent_to_temporary_enters_heap() {
        let mut store = Store::new();
        store.set_permanent("k", 1);
        assert_eq!(store.temporary_len(), 0);

        let at = Instant::now() + ms(100);
        assert_eq!(store.set_temporary("k", 1, Expiry::At(at)), Signal::Wake);
        assert_eq!(store.temporary_len(), 1);
        assert_eq!(store.next_deadline(), Some(at));
        store.assert_consistent();
    }

    #[test]
    fn test_set_temporary_with_permanent_expiry() {
        let mut store = Store::new();
        let at = Instant::now() + ms(100);

        let _ = store.set_temporary("k", 1, Expiry::At(at));
        assert_eq!(store.set_temporary("k", 2, Expiry::Permanent), Signal::Quiet);

        assert_eq!(store.get("k"), Some((&2, Expiry::Permanent)));
        assert_eq!(store.temporary_len(), 0);
        assert_eq!(store.stats().permanent, 1);
        store.assert_consistent();
    }

    #[test]
    fn test_wake_only_when_new_root() {
        let mut store = Store::new();
        let base = Instant::now();

        assert_eq!(store.set_temporary("a", 1, Expiry::At(base + ms(100))), Signal::Wake);
        assert_eq!(store.set_temporary("b", 2, Expiry::At(base + ms(200))), Signal::Quiet);
        assert_eq!(store.set_temporary("c", 3, Expiry::At(base + ms(50))), Signal::Wake);

        // Moving b ahead of everything makes it the root.
        let (ok, signal) = store.set_expiry("b", Expiry::At(base + ms(10)), base);
        assert!(ok);
        assert_eq!(signal, Signal::Wake);
        store.assert_consistent();
    }

    #[test]
    fn test_remove() {
        let mut store = Store::new();
        let _ = store.set_temporary("a", 1, Expiry::At(Instant::now() + ms(100)));
        store.set_permanent("b", 2);

        assert!(store.remove("a"));
        assert!(!store.remove("a"));
        assert!(store.remove("b"));
        assert!(store.is_empty());
        assert_eq!(store.temporary_len(), 0);
        assert_eq!(store.stats().removed, 2);
        store.assert_consistent();
    }

    #[test]
    fn test_remove_all_is_silent() {
        let mut store = Store::new();
        for i in 0..10 {
            let _ = store.set_temporary(i, i, Expiry::At(Instant::now() + ms(100 + i)));
        }
        store.set_permanent(100, 100);

        store.remove_all();

        let stats = store.stats();
        assert_eq!(stats.current, 0);
        assert_eq!(stats.removed, 0);
        assert_eq!(stats.expired, 0);
        assert_eq!(store.next_deadline(), None);
        store.assert_consistent();
    }

    #[test]
    fn test_make_permanent_idempotent() {
        let mut store = Store::new();
        let _ = store.set_temporary("k", 1, Expiry::At(Instant::now() + ms(100)));

        assert!(store.make_permanent("k"));
        let after_first = store.stats();
        assert!(store.make_permanent("k"));
        assert_eq!(store.stats(), after_first);
        assert_eq!(after_first.permanent, 1);
        assert_eq!(store.get("k"), Some((&1, Expiry::Permanent)));
        assert!(!store.make_permanent("missing"));
        store.assert_consistent();
    }

    #[test]
    fn test_set_expiry_in_past_removes() {
        let mut store = Store::new();
        let now = Instant::now();
        let _ = store.set_temporary("k", 1, Expiry::At(now + ms(100)));

        let (live, _) = store.set_expiry("k", Expiry::At(now), now);
        assert!(!live);
        assert!(!store.contains_key("k"));

        let stats = store.stats();
        assert_eq!(stats.removed, 1);
        assert_eq!(stats.expired, 0);
        store.assert_consistent();
    }

    #[test]
    fn test_set_expiry_variants() {
        let mut store = Store::new();
        let now = Instant::now();

        assert_eq!(store.set_expiry("missing", Expiry::At(now + ms(1)), now), (false, Signal::Quiet));

        store.set_permanent("k", 1);
        let (ok, _) = store.set_expiry("k", Expiry::At(now + ms(100)), now);
        assert!(ok);
        assert_eq!(store.get("k"), Some((&1, Expiry::At(now + ms(100)))));
        store.assert_consistent();

        let (ok, _) = store.set_expiry("k", Expiry::Permanent, now);
        assert!(ok);
        assert_eq!(store.get("k"), Some((&1, Expiry::Permanent)));
        assert_eq!(store.stats().permanent, 2);
        store.assert_consistent();
    }

    #[test]
    fn test_pop_due_in_order() {
        let mut store = Store::new();
        let base = Instant::now();

        let _ = store.set_temporary("100ms", 1, Expiry::At(base + ms(100)));
        let _ = store.set_temporary("50ms", 2, Expiry::At(base + ms(50)));
        let _ = store.set_temporary("200ms", 3, Expiry::At(base + ms(200)));
        store.set_permanent("forever", 4);

        assert!(store.pop_due(base + ms(10)).is_empty());

        let due = store.pop_due(base + ms(150));
        let keys: Vec<_> = due.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec!["50ms", "100ms"]);
        assert_eq!(store.next_deadline(), Some(base + ms(200)));

        let due = store.pop_due(base + ms(1000));
        assert_eq!(due, vec![("200ms", 3)]);
        assert_eq!(store.len(), 1);
        assert_eq!(store.stats().expired, 3);
        store.assert_consistent();
    }

    #[test]
    fn test_snapshot_and_keys() {
        let mut store = Store::new();
        store.set_permanent("a".to_string(), 1);
        let _ = store.set_temporary("b".to_string(), 2, Expiry::At(Instant::now() + ms(100)));

        let snap = store.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap.get("a"), Some(&1));
        assert_eq!(snap.get("b"), Some(&2));

        let mut keys = store.keys();
        keys.sort();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_for_each_stops_on_break() {
        let mut store = Store::new();
        for i in 0..10 {
            store.set_permanent(i, i * 10);
        }

        let mut seen = Vec::new();
        store.for_each(|key, value| {
            assert_eq!(*value, key * 10);
            seen.push(*key);
            if seen.len() == 3 {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });
        assert_eq!(seen.len(), 3);

        let mut total = 0;
        store.for_each(|_, value| {
            total += value;
            ControlFlow::Continue(())
        });
        assert_eq!(total, 450);
    }

    #[test]
    fn test_with_capacity_presizes() {
        let mut store: Store<u32, u32> = Store::with_capacity(128);
        assert!(store.capacity() >= 128);
        assert!(store.is_empty());

        store.set_permanent(1, 1);
        assert_eq!(store.len(), 1);
        store.assert_consistent();
    }

    #[test]
    fn test_expiry_helpers() {
        assert_eq!(Expiry::after(Duration::ZERO), Expiry::Permanent);
        assert!(Expiry::Permanent.remaining().is_none());

        let now = Instant::now();
        assert!(Expiry::At(now).is_due(now));
        assert!(!Expiry::At(now + ms(1)).is_due(now));
        assert!(!Expiry::Permanent.is_due(now));
        assert!(Expiry::At(now + ms(1)) < Expiry::Permanent);

        let remaining = Expiry::after(Duration::from_secs(60)).remaining().unwrap();
        assert!(remaining > Duration::from_secs(59));
    }

    #[test]
    fn test_unrepresentable_ttl_is_permanent() {
        assert_eq!(Expiry::after(Duration::MAX), Expiry::Permanent);

        let mut store = Store::new();
        let _ = store.set_temporary("k", 1, Expiry::after(Duration::MAX));
        assert_eq!(store.get("k"), Some((&1, Expiry::Permanent)));
        assert_eq!(store.temporary_len(), 0);
        store.assert_consistent();
    }
}
