// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
//! Doubly-linked lists of event records, threaded through link slots
//! stored in the records themselves. Everything is O(1); no node
//! allocation, just slab indices.

use smallvec::SmallVec;

use crate::{
    event::EventRecord,
    free_list::{FreeList, Idx},
};

/// Which of the two per-record link slots a list threads through. Each
/// record can sit in one registry list and the active list at the same
/// time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LinkSlot {
    Registry,
    Active,
}

#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Link {
    next: Option<Idx<EventRecord>>,
    prev: Option<Idx<EventRecord>>,
}

#[derive(Debug)]
pub(crate) struct ListHead {
    slot: LinkSlot,
    head: Option<Idx<EventRecord>>,
    tail: Option<Idx<EventRecord>>,
    len: usize,
}

impl ListHead {
    pub(crate) fn new(slot: LinkSlot) -> ListHead {
        ListHead {
            slot,
            head: None,
            tail: None,
            len: 0,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn front(&self) -> Option<Idx<EventRecord>> {
        self.head
    }

    pub(crate) fn push_back(&mut self, slab: &mut FreeList<EventRecord>, idx: Idx<EventRecord>) {
        let link = slab[idx].link_mut(self.slot);
        debug_assert!(link.next.is_none() && link.prev.is_none());
        link.prev = self.tail;
        link.next = None;

        match self.tail {
            Some(tail) => slab[tail].link_mut(self.slot).next = Some(idx),
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
        self.len += 1;
    }

    pub(crate) fn remove(&mut self, slab: &mut FreeList<EventRecord>, idx: Idx<EventRecord>) {
        let Link { next, prev } = *slab[idx].link(self.slot);

        match prev {
            Some(prev) => slab[prev].link_mut(self.slot).next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => slab[next].link_mut(self.slot).prev = prev,
            None => self.tail = prev,
        }

        *slab[idx].link_mut(self.slot) = Link::default();
        self.len -= 1;
    }

    pub(crate) fn pop_front(&mut self, slab: &mut FreeList<EventRecord>) -> Option<Idx<EventRecord>> {
        let front = self.head?;
        self.remove(slab, front);
        Some(front)
    }

    /// Snapshot of the list order. Used where the caller mutates records
    /// (or other lists) while walking, e.g. signal fan-out and shutdown
    /// cancellation.
    pub(crate) fn snapshot(&self, slab: &FreeList<EventRecord>) -> SmallVec<[Idx<EventRecord>; 8]> {
        let mut out = SmallVec::new();
        let mut cursor = self.head;
        while let Some(idx) = cursor {
            out.push(idx);
            cursor = slab[idx].link(self.slot).next;
        }
        out
    }
}
