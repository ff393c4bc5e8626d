// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
//! I/O readiness source: the epoll descriptor plus an fd-indexed table
//! of `(read event, write event)` slots. The kernel registration for an
//! fd is always the union of what the resident events requested; read
//! and write halves share it through `EPOLL_CTL_MOD`.

use std::{
    fs::File,
    os::unix::io::{AsRawFd, FromRawFd, RawFd},
};

use log::debug;
use nix::sys::epoll::{
    epoll_create1, epoll_ctl, epoll_wait, EpollCreateFlags, EpollEvent, EpollFlags, EpollOp,
};

use crate::{
    error::{EventideError, Result},
    event::{EventFlags, EventRecord, Membership},
    free_list::{FreeList, Idx},
    list::ListHead,
};

/// Largest readiness batch; the buffer doubles up to this when a wait
/// comes back full.
const MAX_BATCH: usize = 4096;

#[derive(Debug, Default, Clone, Copy)]
struct IoSlots {
    read: Option<Idx<EventRecord>>,
    write: Option<Idx<EventRecord>>,
}

pub(crate) struct IoSource {
    epoll: File,
    table: Vec<IoSlots>,
    batch: Vec<EpollEvent>,
}

impl std::fmt::Debug for IoSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoSource")
            .field("epoll", &self.epoll)
            .field("table_slots", &self.table.len())
            .field("batch_slots", &self.batch.len())
            .finish()
    }
}

impl IoSource {
    pub(crate) fn new(table_slots: usize, batch_slots: usize) -> Result<IoSource> {
        let epfd = epoll_create1(EpollCreateFlags::EPOLL_CLOEXEC)?;
        Ok(IoSource {
            epoll: unsafe { File::from_raw_fd(epfd) },
            table: vec![IoSlots::default(); table_slots.max(1)],
            batch: vec![EpollEvent::empty(); batch_slots.clamp(1, MAX_BATCH)],
        })
    }

    fn epfd(&self) -> RawFd {
        self.epoll.as_raw_fd()
    }

    /// Register one of the reactor's own descriptors (signalfd, timerfd,
    /// interrupter) for edge-triggered read readiness.
    pub(crate) fn register_carrier(&self, fd: RawFd) -> Result<()> {
        let mut event = EpollEvent::new(EpollFlags::EPOLLIN | EpollFlags::EPOLLET, fd as u64);
        epoll_ctl(self.epfd(), EpollOp::EpollCtlAdd, fd, &mut event)?;
        Ok(())
    }

    fn ensure_table_covers(&mut self, fd: RawFd) {
        let fd = fd as usize;
        let mut new_size = self.table.len();
        if fd < new_size {
            return;
        }
        while new_size <= fd {
            new_size <<= 1;
        }
        self.table.resize(new_size, IoSlots::default());
    }

    /// Kernel event set an fd's registration should carry: the union of
    /// the directions and trigger modes of every event resident on it.
    fn desired_events(slab: &FreeList<EventRecord>, slots: IoSlots) -> EpollFlags {
        let mut events = EpollFlags::empty();
        for idx in [slots.read, slots.write].iter().flatten() {
            let flags = slab[*idx].flags;
            if flags.contains(EventFlags::READ) {
                events |= EpollFlags::EPOLLIN;
            }
            if flags.contains(EventFlags::WRITE) {
                events |= EpollFlags::EPOLLOUT;
            }
            if flags.contains(EventFlags::EDGE_TRIGGERED) {
                events |= EpollFlags::EPOLLET;
            }
        }
        events
    }

    /// Enroll an I/O event. Fails with `Exists` if another event already
    /// holds a requested direction; on kernel failure the table is left
    /// unchanged.
    pub(crate) fn add(&mut self, slab: &mut FreeList<EventRecord>, idx: Idx<EventRecord>) -> Result<()> {
        let fd = slab[idx].target();
        let flags = slab[idx].flags;
        self.ensure_table_covers(fd);

        let slots = self.table[fd as usize];
        if flags.contains(EventFlags::READ) && slots.read.is_some() {
            debug!("another event already reads fd {}", fd);
            return Err(EventideError::Exists);
        }
        if flags.contains(EventFlags::WRITE) && slots.write.is_some() {
            debug!("another event already writes fd {}", fd);
            return Err(EventideError::Exists);
        }

        let occupied = slots.read.is_some() || slots.write.is_some();
        let op = if occupied {
            EpollOp::EpollCtlMod
        } else {
            EpollOp::EpollCtlAdd
        };
        let mut desired = slots;
        if flags.contains(EventFlags::READ) {
            desired.read = Some(idx);
        }
        if flags.contains(EventFlags::WRITE) {
            desired.write = Some(idx);
        }

        let mut event = EpollEvent::new(Self::desired_events(slab, desired), fd as u64);
        debug!("epoll_ctl: op={:?} fd={}", op, fd);
        epoll_ctl(self.epfd(), op, fd, &mut event)?;

        self.table[fd as usize] = desired;
        Ok(())
    }

    /// Drop an I/O event from its fd's registration: `DEL` when the fd
    /// empties, `MOD` down to the surviving half otherwise. Kernel
    /// failure here means the reactor's view of the fd diverged from the
    /// kernel's and is unrecoverable.
    pub(crate) fn del(&mut self, slab: &mut FreeList<EventRecord>, idx: Idx<EventRecord>) {
        let fd = slab[idx].target();
        let slots = &mut self.table[fd as usize];
        if slots.read == Some(idx) {
            slots.read = None;
        }
        if slots.write == Some(idx) {
            slots.write = None;
        }
        let remaining = *slots;

        if remaining.read.is_none() && remaining.write.is_none() {
            debug!("epoll_ctl: op=EpollCtlDel fd={}", fd);
            epoll_ctl(
                self.epfd(),
                EpollOp::EpollCtlDel,
                fd,
                None::<&mut EpollEvent>,
            )
            .expect("epoll_ctl(EPOLL_CTL_DEL)");
        } else {
            let mut event = EpollEvent::new(Self::desired_events(slab, remaining), fd as u64);
            debug!("epoll_ctl: op=EpollCtlMod fd={}", fd);
            epoll_ctl(self.epfd(), EpollOp::EpollCtlMod, fd, &mut event)
                .expect("epoll_ctl(EPOLL_CTL_MOD)");
        }
    }

    /// Route one readiness report to the resident events. Error/hangup
    /// schedules both halves with a pure `ERR` delivery; otherwise each
    /// ready direction schedules its slot with the readiness it asked
    /// for. An event holding both directions is scheduled once. Events
    /// already scheduled get the new readiness merged into their pending
    /// delivery.
    pub(crate) fn dispatch(
        &self,
        fd: RawFd,
        kernel_events: EpollFlags,
        slab: &mut FreeList<EventRecord>,
        active: &mut ListHead,
    ) {
        let slots = match self.table.get(fd as usize) {
            Some(slots) => *slots,
            None => return,
        };

        if kernel_events.intersects(EpollFlags::EPOLLERR | EpollFlags::EPOLLHUP) {
            for idx in dedup(slots.read, slots.write) {
                Self::merge_or_activate(slab, active, idx, EventFlags::ERR);
            }
            return;
        }

        let mut ready = EventFlags::empty();
        if kernel_events.contains(EpollFlags::EPOLLIN) {
            ready |= EventFlags::READ;
        }
        if kernel_events.contains(EpollFlags::EPOLLOUT) {
            ready |= EventFlags::WRITE;
        }

        let scheduled_read = match slots.read {
            Some(idx) if ready.contains(EventFlags::READ) => {
                Self::merge_or_activate(slab, active, idx, ready & slab[idx].flags.directions());
                Some(idx)
            }
            _ => None,
        };
        if let Some(idx) = slots.write {
            if ready.contains(EventFlags::WRITE) && scheduled_read != Some(idx) {
                Self::merge_or_activate(slab, active, idx, ready & slab[idx].flags.directions());
            }
        }
    }

    fn merge_or_activate(
        slab: &mut FreeList<EventRecord>,
        active: &mut ListHead,
        idx: Idx<EventRecord>,
        new_flags: EventFlags,
    ) {
        if slab[idx].membership.contains(Membership::IN_ACTIVE) {
            slab[idx].delivered |= new_flags;
        } else {
            {
                let record = &mut slab[idx];
                record.delivered = new_flags;
                record.membership.insert(Membership::IN_ACTIVE);
            }
            active.push_back(slab, idx);
        }
        debug!("io event {:?} is active", idx);
    }

    /// Block (or poll, with a zero timeout) for readiness. EINTR is
    /// retried silently. Returns how many batch entries are valid.
    pub(crate) fn wait(&mut self, timeout_ms: isize) -> Result<usize> {
        loop {
            match epoll_wait(self.epoll.as_raw_fd(), &mut self.batch, timeout_ms) {
                Ok(n) => return Ok(n),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(err) => return Err(err.into()),
            }
        }
    }

    pub(crate) fn batch_entry(&self, i: usize) -> (u64, EpollFlags) {
        (self.batch[i].data(), self.batch[i].events())
    }

    /// A full batch doubles the buffer for the next wait, up to the cap.
    pub(crate) fn grow_batch_if_full(&mut self, reported: usize) {
        if reported == self.batch.len() && self.batch.len() < MAX_BATCH {
            let new_len = self.batch.len() * 2;
            self.batch.resize(new_len, EpollEvent::empty());
        }
    }
}

fn dedup(
    a: Option<Idx<EventRecord>>,
    b: Option<Idx<EventRecord>>,
) -> impl Iterator<Item = Idx<EventRecord>> {
    let b = if a == b { None } else { b };
    a.into_iter().chain(b)
}
