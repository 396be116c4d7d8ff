//! Expiry Heap
//!
//! A binary min-heap of arena ids ordered by each entry's [`Expiry`].
//!
//! The heap never owns entries. It stores ids into a [`SlotMap`] owned by the
//! store, and every entry records its own slot in the heap (`heap_pos`). That
//! back-index is what makes `remove` and `fix` O(log n): the store can find an
//! arbitrary entry's slot without scanning.
//!
//! ```text
//!   slots:  [ id7 , id2 , id9 , id4 ]      arena[id2].heap_pos == Some(1)
//!             root
//! ```
//!
//! Every method that moves ids around takes the arena mutably so both sides
//! of a swap have their `heap_pos` rewritten in the same step. Callers hold
//! the store's write lock for all of this.

use crate::storage::engine::Expiry;
use slotmap::{Key, SlotMap};

/// An arena element that can be tracked by an [`ExpiryHeap`].
pub(crate) trait HeapItem {
    /// Ordering key. Only `Expiry::At` entries are ever pushed.
    fn expiry(&self) -> Expiry;

    /// Current slot in the heap, `None` when not tracked.
    fn heap_pos(&self) -> Option<usize>;

    fn set_heap_pos(&mut self, pos: Option<usize>);
}

/// Index-based binary min-heap with intrusive position tracking.
///
/// Ties between equal expiries are broken arbitrarily.
#[derive(Debug)]
pub(crate) struct ExpiryHeap<I: Key> {
    slots: Vec<I>,
}

impl<I: Key> Default for ExpiryHeap<I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: Key> ExpiryHeap<I> {
    pub(crate) fn new() -> Self {
        Self { slots: Vec::new() }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    /// The id with the smallest expiry, if any.
    #[inline]
    pub(crate) fn peek(&self) -> Option<I> {
        self.slots.first().copied()
    }

    /// Forgets every tracked id. The caller is expected to drop the arena
    /// alongside, so stale `heap_pos` values are never read.
    pub(crate) fn clear(&mut self) {
        self.slots.clear();
    }

    /// Inserts `id` and sifts it into place.
    pub(crate) fn push<T: HeapItem>(&mut self, id: I, arena: &mut SlotMap<I, T>) {
        debug_assert!(arena[id].heap_pos().is_none(), "id already tracked");
        let pos = self.slots.len();
        self.slots.push(id);
        arena[id].set_heap_pos(Some(pos));
        self.up(pos, arena);
    }

    /// Removes and returns the id with the smallest expiry.
    pub(crate) fn pop<T: HeapItem>(&mut self, arena: &mut SlotMap<I, T>) -> Option<I> {
        self.remove(0, arena)
    }

    /// Removes the id stored at `pos`, restoring heap order for the rest.
    /// Returns `None` only if `pos` is out of bounds.
    pub(crate) fn remove<T: HeapItem>(
        &mut self,
        pos: usize,
        arena: &mut SlotMap<I, T>,
    ) -> Option<I> {
        let last = self.slots.len().checked_sub(1)?;
        if pos > last {
            debug_assert!(false, "heap position {pos} out of bounds");
            return None;
        }
        if pos != last {
            self.swap(pos, last, arena);
        }
        let id = self.slots.pop()?;
        arena[id].set_heap_pos(None);

        if pos < self.slots.len() && !self.down(pos, arena) {
            self.up(pos, arena);
        }
        Some(id)
    }

    /// Re-establishes order after the expiry of the id at `pos` changed.
    pub(crate) fn fix<T: HeapItem>(&mut self, pos: usize, arena: &mut SlotMap<I, T>) {
        debug_assert!(pos < self.slots.len(), "heap position {pos} out of bounds");
        if !self.down(pos, arena) {
            self.up(pos, arena);
        }
    }

    #[inline]
    fn less<T: HeapItem>(&self, i: usize, j: usize, arena: &SlotMap<I, T>) -> bool {
        arena[self.slots[i]].expiry() < arena[self.slots[j]].expiry()
    }

    fn swap<T: HeapItem>(&mut self, i: usize, j: usize, arena: &mut SlotMap<I, T>) {
        self.slots.swap(i, j);
        arena[self.slots[i]].set_heap_pos(Some(i));
        arena[self.slots[j]].set_heap_pos(Some(j));
    }

    fn up<T: HeapItem>(&mut self, mut child: usize, arena: &mut SlotMap<I, T>) {
        while child > 0 {
            let parent = (child - 1) / 2;
            if !self.less(child, parent, arena) {
                break;
            }
            self.swap(child, parent, arena);
            child = parent;
        }
    }

    /// Sifts down from `start`. Returns `true` if the element moved.
    fn down<T: HeapItem>(&mut self, start: usize, arena: &mut SlotMap<I, T>) -> bool {
        let n = self.slots.len();
        let mut parent = start;
        loop {
            let left = 2 * parent + 1;
            if left >= n {
                break;
            }
            let mut smallest = left;
            let right = left + 1;
            if right < n && self.less(right, left, arena) {
                smallest = right;
            }
            if !self.less(smallest, parent, arena) {
                break;
            }
            self.swap(parent, smallest, arena);
            parent = smallest;
        }
        parent > start
    }

    /// Full scan of the heap against the arena. Panics on the first
    /// inconsistency: a slot whose entry disagrees about its position, a
    /// permanent entry in the heap, or a child ordered before its parent.
    #[cfg(test)]
    pub(crate) fn assert_consistent<T: HeapItem>(&self, arena: &SlotMap<I, T>) {
        for (pos, &id) in self.slots.iter().enumerate() {
            let item = &arena[id];
            assert_eq!(item.heap_pos(), Some(pos), "stale heap_pos at slot {pos}");
            assert!(
                matches!(item.expiry(), Expiry::At(_)),
                "permanent entry tracked at slot {pos}"
            );
            if pos > 0 {
                let parent = (pos - 1) / 2;
                assert!(
                    arena[self.slots[parent]].expiry() <= item.expiry(),
                    "heap order violated between {parent} and {pos}"
                );
            }
        }
    }
}
