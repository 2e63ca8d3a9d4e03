/// B+Tree node held in memory between record-store round trips.
///
/// A page has a fixed capacity of slots. Slots `[first, capacity)` are live;
/// `first` is the low-water index, so a page fills from the right. Keys are
/// strictly ascending, and slot `capacity-1` of the rightmost page at each
/// level carries the "+infinity" sentinel, represented as an absent key.
///
/// Leaf pages hold values and the doubly-linked leaf-list recids; non-leaf
/// pages hold child recids, where `keys[i]` is the largest key in the
/// subtree under `children[i]`.
use crate::btree::TreeContext;
use crate::types::{Datum, Recid};
use std::cmp::Ordering;

/// Leaf slot payload: either the value itself or a handle to a record the
/// value was spilled into because it was too large to keep in the page.
#[derive(Debug, Clone, PartialEq)]
pub enum LeafValue {
    Inline(Datum),
    Lazy(Recid),
}

#[derive(Debug, Clone, PartialEq)]
pub struct BPage {
    /// Record id this page is persisted under (0 until first persisted).
    pub recid: Recid,
    pub is_leaf: bool,
    /// Smallest used slot; live slots are `[first, capacity)`.
    pub first: usize,
    /// `None` is the sentinel / an unused slot.
    pub keys: Vec<Option<Datum>>,
    /// Leaf only, one per slot.
    pub values: Vec<Option<LeafValue>>,
    /// Non-leaf only, one per slot. 0 = unused.
    pub children: Vec<Recid>,
    /// Leaf only: recid of the left neighbour, 0 = none.
    pub previous: Recid,
    /// Leaf only: recid of the right neighbour, 0 = none.
    pub next: Recid,
}

impl BPage {
    /// Root leaf holding the tree's first entry. The sentinel slot stays
    /// empty: the root is the rightmost page of its level.
    pub(crate) fn new_root_leaf(capacity: usize, key: Datum, value: LeafValue) -> BPage {
        let mut page = BPage::blank(capacity, true);
        page.first = capacity - 2;
        page.keys[capacity - 2] = Some(key);
        page.values[capacity - 2] = Some(value);
        page
    }

    /// Non-leaf root promoted over a split: the two rightmost slots point at
    /// the overflow sibling and the old root.
    pub(crate) fn new_root_overflow(
        capacity: usize,
        overflow_key: Option<Datum>,
        overflow_recid: Recid,
        root_key: Option<Datum>,
        root_recid: Recid,
    ) -> BPage {
        let mut page = BPage::blank(capacity, false);
        page.first = capacity - 2;
        page.keys[capacity - 2] = overflow_key;
        page.children[capacity - 2] = overflow_recid;
        page.keys[capacity - 1] = root_key;
        page.children[capacity - 1] = root_recid;
        page
    }

    /// Empty sibling allocated during a split; starts half-full by
    /// construction (`first = capacity/2`), filled by the caller.
    pub(crate) fn new_overflow(capacity: usize, is_leaf: bool) -> BPage {
        let mut page = BPage::blank(capacity, is_leaf);
        page.first = capacity / 2;
        page
    }

    fn blank(capacity: usize, is_leaf: bool) -> BPage {
        BPage {
            recid: 0,
            is_leaf,
            first: capacity - 1,
            keys: vec![None; capacity],
            values: if is_leaf { vec![None; capacity] } else { Vec::new() },
            children: if is_leaf { Vec::new() } else { vec![0; capacity] },
            previous: 0,
            next: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.keys.len()
    }

    /// Number of live slots (the sentinel slot counts on rightmost pages).
    pub fn fill(&self) -> usize {
        self.capacity() - self.first
    }

    /// A single live slot left.
    pub fn is_empty(&self) -> bool {
        self.first == self.capacity() - 1
    }

    pub fn is_full(&self) -> bool {
        self.first == 0
    }

    /// Largest key under this page; `None` is the +infinity sentinel.
    pub fn largest_key(&self) -> Option<&Datum> {
        self.keys[self.capacity() - 1].as_ref()
    }

    /// Binary search over `[first, capacity-1]` for the smallest slot whose
    /// key is greater than or equal to `key`. The sentinel slot matches
    /// everything, so the result is always a valid slot.
    pub(crate) fn find_children(&self, ctx: &TreeContext, key: &Datum) -> usize {
        let mut left = self.first;
        let mut right = self.capacity() - 1;
        while left < right {
            let middle = (left + right) / 2;
            if ctx.compare(self.keys[middle].as_ref(), Some(key)) == Ordering::Less {
                left = middle + 1;
            } else {
                right = middle;
            }
        }
        right
    }

    /// Shift `keys[first..=index]` and values left by one and write the new
    /// entry at `index`. The caller must ensure the page is not full.
    pub(crate) fn insert_entry(&mut self, index: usize, key: Datum, value: LeafValue) {
        for i in self.first..=index {
            self.keys[i - 1] = self.keys[i].take();
            self.values[i - 1] = self.values[i].take();
        }
        self.first -= 1;
        self.keys[index] = Some(key);
        self.values[index] = Some(value);
    }

    /// Non-leaf counterpart of `insert_entry`.
    pub(crate) fn insert_child(&mut self, index: usize, key: Datum, child: Recid) {
        for i in self.first..=index {
            self.keys[i - 1] = self.keys[i].take();
            self.children[i - 1] = self.children[i];
            self.children[i] = 0;
        }
        self.first -= 1;
        self.keys[index] = Some(key);
        self.children[index] = child;
    }

    /// Shift `keys[first..index]` and values right by one, clearing the
    /// vacated `first` slot.
    pub(crate) fn remove_entry(&mut self, index: usize) {
        for i in (self.first..index).rev() {
            self.keys[i + 1] = self.keys[i].take();
            self.values[i + 1] = self.values[i].take();
        }
        self.keys[self.first] = None;
        self.values[self.first] = None;
        self.first += 1;
    }

    pub(crate) fn set_entry(&mut self, index: usize, key: Option<Datum>, value: Option<LeafValue>) {
        self.keys[index] = key;
        self.values[index] = value;
    }

    pub(crate) fn set_child(&mut self, index: usize, key: Option<Datum>, child: Recid) {
        self.keys[index] = key;
        self.children[index] = child;
    }

    /// Move `count` entries starting at `src` into `dst` starting at
    /// `dst_index`, clearing the source slots.
    pub(crate) fn move_entries_to(
        &mut self,
        src: usize,
        dst: &mut BPage,
        dst_index: usize,
        count: usize,
    ) {
        for i in 0..count {
            dst.keys[dst_index + i] = self.keys[src + i].take();
            dst.values[dst_index + i] = self.values[src + i].take();
        }
    }

    /// Non-leaf counterpart of `move_entries_to`.
    pub(crate) fn move_children_to(
        &mut self,
        src: usize,
        dst: &mut BPage,
        dst_index: usize,
        count: usize,
    ) {
        for i in 0..count {
            dst.keys[dst_index + i] = self.keys[src + i].take();
            dst.children[dst_index + i] = self.children[src + i];
            self.children[src + i] = 0;
        }
    }

    /// In-page bulk move; the ranges may overlap.
    pub(crate) fn copy_entries_within(&mut self, src: usize, dst: usize, count: usize) {
        if dst <= src {
            for i in 0..count {
                self.keys[dst + i] = self.keys[src + i].take();
                self.values[dst + i] = self.values[src + i].take();
            }
        } else {
            for i in (0..count).rev() {
                self.keys[dst + i] = self.keys[src + i].take();
                self.values[dst + i] = self.values[src + i].take();
            }
        }
    }

    /// Non-leaf counterpart of `copy_entries_within`.
    pub(crate) fn copy_children_within(&mut self, src: usize, dst: usize, count: usize) {
        if dst <= src {
            for i in 0..count {
                self.keys[dst + i] = self.keys[src + i].take();
                self.children[dst + i] = self.children[src + i];
                self.children[src + i] = 0;
            }
        } else {
            for i in (0..count).rev() {
                self.keys[dst + i] = self.keys[src + i].take();
                self.children[dst + i] = self.children[src + i];
                self.children[src + i] = 0;
            }
        }
    }
}
