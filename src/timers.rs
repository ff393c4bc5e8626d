// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
//! Timer readiness source: a timerfd in absolute monotonic mode,
//! reprogrammed to the heap minimum whenever an insertion, removal or
//! expiration changes it. With an empty heap the timerfd is disarmed.

use std::os::unix::io::{AsRawFd, RawFd};

use log::debug;
use nix::sys::{
    time::TimeSpec,
    timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags},
};

use crate::{
    error::Result,
    event::{EventRecord, Membership},
    free_list::{FreeList, Idx},
    list::ListHead,
    sys::{drain_counter_fd, monotonic_now},
    timer_heap::TimerHeap,
};

pub(crate) struct TimerSource {
    timerfd: TimerFd,
    heap: TimerHeap,
    /// Deadline the timerfd is currently programmed for, to skip
    /// redundant `timerfd_settime` calls.
    armed: Option<TimeSpec>,
    next_seq: u64,
}

impl TimerSource {
    pub(crate) fn new() -> Result<TimerSource> {
        let timerfd = TimerFd::new(
            ClockId::CLOCK_MONOTONIC,
            TimerFlags::TFD_CLOEXEC | TimerFlags::TFD_NONBLOCK,
        )?;
        Ok(TimerSource {
            timerfd,
            heap: TimerHeap::default(),
            armed: None,
            next_seq: 0,
        })
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.timerfd.as_raw_fd()
    }

    pub(crate) fn heap_len(&self) -> usize {
        self.heap.len()
    }

    /// Insertion sequence number, the tie-breaker for equal deadlines.
    pub(crate) fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    pub(crate) fn insert(&mut self, slab: &mut FreeList<EventRecord>, idx: Idx<EventRecord>) {
        self.heap.push(slab, idx);
        self.reprogram(slab);
    }

    /// Erase a still-pending timer. No-op for a timer that already
    /// expired out of the heap.
    pub(crate) fn remove(&mut self, slab: &mut FreeList<EventRecord>, idx: Idx<EventRecord>) {
        if slab[idx].heap_idx().is_some() {
            self.heap.erase(slab, idx);
            self.reprogram(slab);
        }
    }

    /// Discard the expiration counts, pop everything that is due and
    /// activate it in deadline order, then re-arm for the new minimum.
    pub(crate) fn drain(&mut self, slab: &mut FreeList<EventRecord>, active: &mut ListHead) {
        drain_counter_fd(self.fd());

        let now = monotonic_now();
        while let Some(root) = self.heap.peek() {
            let (deadline, _) = slab[root].timer_key();
            if deadline > now {
                break;
            }
            self.heap.pop(slab);

            if slab[root].membership.contains(Membership::IN_ACTIVE) {
                // Canceled while still pending; fold the expiry into the
                // scheduled delivery.
                let record = &mut slab[root];
                record.delivered |= record.flags;
            } else {
                {
                    let record = &mut slab[root];
                    record.delivered = record.flags;
                    record.membership.insert(Membership::IN_ACTIVE);
                }
                active.push_back(slab, root);
            }
            debug!("timer event {:?} is active", root);
        }

        self.reprogram(slab);
    }

    fn reprogram(&mut self, slab: &FreeList<EventRecord>) {
        let want = self.heap.peek().map(|idx| slab[idx].timer_key().0);
        if want == self.armed {
            return;
        }
        match want {
            Some(deadline) => {
                debug!(
                    "timerfd_settime: seconds={} nanoseconds={}",
                    deadline.tv_sec(),
                    deadline.tv_nsec()
                );
                self.timerfd
                    .set(
                        Expiration::OneShot(deadline),
                        TimerSetTimeFlags::TFD_TIMER_ABSTIME,
                    )
                    .expect("timerfd_settime");
            }
            None => self.timerfd.unset().expect("timerfd disarm"),
        }
        self.armed = want;
    }
}
