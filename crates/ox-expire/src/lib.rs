#![forbid(unsafe_code)]

//! Indexed binary min-heap scheduling key expirations.
//!
//! Each item carries the arena id of its owning entry. Whenever an item
//! moves inside the array, `on_move(owner, slot)` fires so the owner can
//! keep its stored slot index current; that is what makes `remove(slot)`
//! O(log n) with no search.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapItem {
    pub expires_at_ms: u64,
    pub owner: usize,
}

#[derive(Debug, Default)]
pub struct ExpiryHeap {
    items: Vec<HeapItem>,
}

impl ExpiryHeap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[must_use]
    pub fn peek(&self, slot: usize) -> Option<&HeapItem> {
        self.items.get(slot)
    }

    pub fn insert(&mut self, item: HeapItem, on_move: &mut dyn FnMut(usize, usize)) {
        let slot = self.items.len();
        on_move(item.owner, slot);
        self.items.push(item);
        self.sift_up(slot, on_move);
    }

    /// Reschedule the item at `slot` and restore heap order.
    pub fn update(&mut self, slot: usize, expires_at_ms: u64, on_move: &mut dyn FnMut(usize, usize)) {
        self.items[slot].expires_at_ms = expires_at_ms;
        self.fix(slot, on_move);
    }

    /// Remove the item at `slot`: swap in the last item, shrink, re-sift.
    pub fn remove(&mut self, slot: usize, on_move: &mut dyn FnMut(usize, usize)) -> HeapItem {
        let removed = self.items[slot];
        let last = self.items.len() - 1;
        if slot != last {
            self.items.swap(slot, last);
            self.items.pop();
            on_move(self.items[slot].owner, slot);
            self.fix(slot, on_move);
        } else {
            self.items.pop();
        }
        removed
    }

    // The swapped-in replacement may violate heap order in either
    // direction, depending on which subtree it came from.
    fn fix(&mut self, slot: usize, on_move: &mut dyn FnMut(usize, usize)) {
        if slot > 0 && self.items[parent(slot)].expires_at_ms > self.items[slot].expires_at_ms {
            self.sift_up(slot, on_move);
        } else {
            self.sift_down(slot, on_move);
        }
    }

    fn sift_up(&mut self, mut slot: usize, on_move: &mut dyn FnMut(usize, usize)) {
        while slot > 0 {
            let up = parent(slot);
            if self.items[up].expires_at_ms <= self.items[slot].expires_at_ms {
                break;
            }
            self.items.swap(slot, up);
            on_move(self.items[slot].owner, slot);
            on_move(self.items[up].owner, up);
            slot = up;
        }
    }

    fn sift_down(&mut self, mut slot: usize, on_move: &mut dyn FnMut(usize, usize)) {
        let len = self.items.len();
        loop {
            let mut min = slot;
            let l = left(slot);
            let r = right(slot);
            if l < len && self.items[l].expires_at_ms < self.items[min].expires_at_ms {
                min = l;
            }
            if r < len && self.items[r].expires_at_ms < self.items[min].expires_at_ms {
                min = r;
            }
            if min == slot {
                break;
            }
            self.items.swap(slot, min);
            on_move(self.items[slot].owner, slot);
            on_move(self.items[min].owner, min);
            slot = min;
        }
    }
}

fn parent(slot: usize) -> usize {
    (slot - 1) / 2
}

fn left(slot: usize) -> usize {
    slot * 2 + 1
}

fn right(slot: usize) -> usize {
    slot * 2 + 2
}
