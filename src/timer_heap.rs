// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
//! Indexed binary min-heap of timer events, keyed `(deadline, seq)` so
//! equal deadlines pop in insertion order. Each resident record stores
//! its current heap position, which makes erase-by-record O(log n).

use crate::{
    event::EventRecord,
    free_list::{FreeList, Idx},
};

#[derive(Debug, Default)]
pub(crate) struct TimerHeap {
    heap: Vec<Idx<EventRecord>>,
}

impl TimerHeap {
    pub(crate) fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }

    pub(crate) fn peek(&self) -> Option<Idx<EventRecord>> {
        self.heap.first().copied()
    }

    pub(crate) fn push(&mut self, slab: &mut FreeList<EventRecord>, idx: Idx<EventRecord>) {
        debug_assert!(slab[idx].heap_idx().is_none());
        let hole = self.heap.len();
        self.heap.push(idx);
        self.sift_up(slab, hole, idx);
    }

    pub(crate) fn pop(&mut self, slab: &mut FreeList<EventRecord>) -> Option<Idx<EventRecord>> {
        let root = *self.heap.first()?;
        let last = self.heap.pop().expect("heap is non-empty");
        if !self.heap.is_empty() {
            self.sift_down(slab, 0, last);
        }
        slab[root].set_heap_idx(None);
        Some(root)
    }

    /// Remove a record from the middle of the heap through its stored
    /// position.
    pub(crate) fn erase(&mut self, slab: &mut FreeList<EventRecord>, idx: Idx<EventRecord>) {
        let pos = slab[idx].heap_idx().expect("record is heap-resident");
        debug_assert_eq!(self.heap[pos], idx);

        let last = self.heap.pop().expect("heap is non-empty");
        if pos < self.heap.len() {
            // Refill the hole with the former tail; it may need to move
            // either way.
            if pos > 0 && slab[last].timer_key() < slab[self.heap[(pos - 1) / 2]].timer_key() {
                self.sift_up(slab, pos, last);
            } else {
                self.sift_down(slab, pos, last);
            }
        }
        slab[idx].set_heap_idx(None);
    }

    fn sift_up(
        &mut self,
        slab: &mut FreeList<EventRecord>,
        mut hole: usize,
        node: Idx<EventRecord>,
    ) {
        let key = slab[node].timer_key();
        while hole > 0 {
            let parent = (hole - 1) / 2;
            let parent_idx = self.heap[parent];
            if slab[parent_idx].timer_key() <= key {
                break;
            }
            self.heap[hole] = parent_idx;
            slab[parent_idx].set_heap_idx(Some(hole));
            hole = parent;
        }
        self.heap[hole] = node;
        slab[node].set_heap_idx(Some(hole));
    }

    fn sift_down(
        &mut self,
        slab: &mut FreeList<EventRecord>,
        mut hole: usize,
        node: Idx<EventRecord>,
    ) {
        let key = slab[node].timer_key();
        loop {
            let mut child = 2 * hole + 1;
            if child >= self.heap.len() {
                break;
            }
            let right = child + 1;
            if right < self.heap.len()
                && slab[self.heap[right]].timer_key() < slab[self.heap[child]].timer_key()
            {
                child = right;
            }
            let child_idx = self.heap[child];
            if key <= slab[child_idx].timer_key() {
                break;
            }
            self.heap[hole] = child_idx;
            slab[child_idx].set_heap_idx(Some(hole));
            hole = child;
        }
        self.heap[hole] = node;
        slab[node].set_heap_idx(Some(hole));
    }
}
