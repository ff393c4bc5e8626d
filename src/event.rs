// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
use std::{convert::TryFrom, fmt, os::unix::io::RawFd, time::Duration};

use nix::sys::{
    signal::Signal,
    time::{TimeSpec, TimeValLike},
};

use crate::{
    error::{EventideError, Result},
    free_list::Idx,
    list::{Link, LinkSlot},
    reactor::Reactor,
    sys::monotonic_now,
};

bitflags::bitflags! {
    /// What an event watches and what a callback is told about a firing.
    ///
    /// `READ`/`WRITE` double as the I/O kind; `SIGNAL` and `TIMER` tag the
    /// other two kinds and are set by the corresponding constructors. `ERR`
    /// and `CANCELED` are delivery-only: they may appear in
    /// [`Delivery::flags`](crate::Delivery) but are rejected on input.
    pub struct EventFlags: u32 {
        /// The fd can be read (`EPOLLIN`).
        const READ = 0x01;
        /// The fd can be written (`EPOLLOUT`).
        const WRITE = 0x02;
        /// Signal event kind.
        const SIGNAL = 0x04;
        /// Timer event kind.
        const TIMER = 0x08;
        /// The event survives a firing and stays registered.
        const PERSIST = 0x10;
        /// Edge-triggered kernel registration (I/O only).
        const EDGE_TRIGGERED = 0x20;
        /// Delivery only: the kernel reported an error or hangup on the fd.
        const ERR = 0x1000;
        /// Delivery only: the event was canceled by the user or by reactor
        /// teardown.
        const CANCELED = 0x2000;
    }
}

bitflags::bitflags! {
    /// Which reactor structures an event record currently belongs to.
    pub(crate) struct Membership: u8 {
        const IN_REGISTRY = 0x01;
        const IN_ACTIVE = 0x02;
        const IN_CALLBACK = 0x04;
    }
}

impl EventFlags {
    pub(crate) fn directions(self) -> EventFlags {
        self & (EventFlags::READ | EventFlags::WRITE)
    }

    fn kind_bits(self) -> EventFlags {
        self & (EventFlags::READ | EventFlags::WRITE | EventFlags::SIGNAL | EventFlags::TIMER)
    }
}

/// Handle to a registered event, returned by [`Reactor::add`].
///
/// The handle stays valid until the event becomes unbound (it fired
/// without `PERSIST`, was deleted or canceled, or the reactor was torn
/// down); after that every use reports
/// [`NotExists`](crate::EventideError::NotExists), even if the internal
/// slot has been reused by a later registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventId(pub(crate) Idx<EventRecord>);

/// What a callback is handed on each invocation.
#[derive(Debug, Clone, Copy)]
pub struct Delivery {
    /// The handle of the firing event, usable for self-deletion or
    /// self-cancellation through the reactor.
    pub id: EventId,
    /// The fd for I/O events, the signal number for signal events, `-1`
    /// for timers.
    pub target: RawFd,
    /// The delivered flag set: the readiness that fired, or `ERR` /
    /// `CANCELED`.
    pub flags: EventFlags,
}

/// Event callback. Runs on the reactor thread; receives the owning
/// reactor so it may add, delete or cancel events (including itself).
pub type Callback = Box<dyn FnMut(&mut Reactor, Delivery) + 'static>;

/// Kind-specific payload of an event record.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Kind {
    Io {
        fd: RawFd,
    },
    Signal {
        signum: i32,
    },
    Timer {
        deadline: TimeSpec,
        seq: u64,
        heap_idx: Option<usize>,
    },
}

/// An event descriptor, built by one of the kind constructors and
/// consumed by [`Reactor::add`].
///
/// The three kinds are mutually exclusive by construction. User context
/// lives in the callback closure's captures; the reactor never touches
/// it.
///
/// ```no_run
/// use eventide::{Event, EventFlags, Reactor};
///
/// let mut reactor = Reactor::new().unwrap();
/// // SIGHUP, delivered to the callback for as long as the event stays
/// // registered.
/// let id = reactor
///     .add(Event::signal(
///         1,
///         EventFlags::PERSIST,
///         Box::new(|_reactor, delivery| {
///             println!("got signal {}", delivery.target);
///         }),
///     ))
///     .unwrap();
/// # let _ = id;
/// ```
pub struct Event {
    pub(crate) kind: Kind,
    pub(crate) flags: EventFlags,
    pub(crate) callback: Callback,
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("kind", &self.kind)
            .field("flags", &self.flags)
            .finish()
    }
}

impl Event {
    /// An I/O event on `fd`. `flags` must contain at least one of `READ`
    /// and `WRITE` and may add `PERSIST` and `EDGE_TRIGGERED`.
    pub fn io(fd: RawFd, flags: EventFlags, callback: Callback) -> Event {
        Event {
            kind: Kind::Io { fd },
            flags,
            callback,
        }
    }

    /// A signal event on `signum`. `flags` may contain `PERSIST`;
    /// `EDGE_TRIGGERED` is accepted but ignored for signals.
    pub fn signal(signum: i32, flags: EventFlags, callback: Callback) -> Event {
        Event {
            kind: Kind::Signal { signum },
            flags: flags | EventFlags::SIGNAL,
            callback,
        }
    }

    /// A timer firing once at `deadline`, an absolute instant on the
    /// monotonic clock (see [`monotonic_now`]). Timers take no flags: a
    /// timer fires exactly once per registration; re-arm from the
    /// callback with [`Reactor::rearm_timer`] for periodic behavior.
    pub fn timer(deadline: TimeSpec, callback: Callback) -> Event {
        Event {
            kind: Kind::Timer {
                deadline,
                seq: 0,
                heap_idx: None,
            },
            flags: EventFlags::TIMER,
            callback,
        }
    }

    /// A timer firing once `interval` from now.
    pub fn timer_after(interval: Duration, callback: Callback) -> Event {
        let nanos = i64::try_from(interval.as_nanos()).unwrap_or(i64::MAX);
        Event::timer(monotonic_now() + TimeSpec::nanoseconds(nanos), callback)
    }

    /// Input validation performed by [`Reactor::add`].
    pub(crate) fn validate(&self) -> Result<()> {
        if self
            .flags
            .intersects(EventFlags::ERR | EventFlags::CANCELED)
        {
            return Err(EventideError::InvalidEvent(
                "ERR and CANCELED are reserved for delivery",
            ));
        }

        match self.kind {
            Kind::Io { fd } => {
                if self.flags.kind_bits() != self.flags.directions()
                    || self.flags.directions().is_empty()
                {
                    return Err(EventideError::InvalidEvent(
                        "an I/O event needs READ, WRITE or both",
                    ));
                }
                if fd < 0 {
                    return Err(EventideError::InvalidEvent("negative file descriptor"));
                }
            }
            Kind::Signal { signum } => {
                if self.flags.kind_bits() != EventFlags::SIGNAL {
                    return Err(EventideError::InvalidEvent(
                        "READ, WRITE and TIMER do not apply to a signal event",
                    ));
                }
                if Signal::try_from(signum).is_err() {
                    return Err(EventideError::InvalidEvent("signal number out of range"));
                }
            }
            Kind::Timer { deadline, .. } => {
                if self.flags.kind_bits() != EventFlags::TIMER {
                    return Err(EventideError::InvalidEvent(
                        "READ, WRITE and SIGNAL do not apply to a timer event",
                    ));
                }
                if deadline <= TimeSpec::seconds(0) {
                    return Err(EventideError::InvalidEvent(
                        "timer deadline must be a positive monotonic instant",
                    ));
                }
            }
        }
        Ok(())
    }
}

/// A registered event as the reactor stores it: the user-supplied
/// descriptor plus the lifecycle state the dispatch loop maintains.
pub(crate) struct EventRecord {
    pub(crate) kind: Kind,
    pub(crate) flags: EventFlags,
    /// What the callback will be handed at the next invocation.
    pub(crate) delivered: EventFlags,
    /// Firings accumulated while active but not yet dispatched (signal
    /// coalescing).
    pub(crate) pending: u32,
    pub(crate) membership: Membership,
    /// Taken out for the duration of an invocation.
    pub(crate) callback: Option<Callback>,
    pub(crate) registry_link: Link,
    pub(crate) active_link: Link,
}

impl EventRecord {
    pub(crate) fn new(kind: Kind, flags: EventFlags, callback: Callback) -> EventRecord {
        EventRecord {
            kind,
            flags,
            delivered: EventFlags::empty(),
            pending: 0,
            membership: Membership::empty(),
            callback: Some(callback),
            registry_link: Link::default(),
            active_link: Link::default(),
        }
    }

    pub(crate) fn target(&self) -> RawFd {
        match self.kind {
            Kind::Io { fd } => fd,
            Kind::Signal { signum } => signum,
            Kind::Timer { .. } => -1,
        }
    }

    pub(crate) fn is_signal(&self) -> bool {
        matches!(self.kind, Kind::Signal { .. })
    }

    pub(crate) fn timer_key(&self) -> (TimeSpec, u64) {
        match self.kind {
            Kind::Timer { deadline, seq, .. } => (deadline, seq),
            _ => unreachable!("timer key of a non-timer event"),
        }
    }

    pub(crate) fn heap_idx(&self) -> Option<usize> {
        match self.kind {
            Kind::Timer { heap_idx, .. } => heap_idx,
            _ => None,
        }
    }

    pub(crate) fn set_heap_idx(&mut self, pos: Option<usize>) {
        match &mut self.kind {
            Kind::Timer { heap_idx, .. } => *heap_idx = pos,
            _ => unreachable!("heap position of a non-timer event"),
        }
    }

    pub(crate) fn link(&self, slot: LinkSlot) -> &Link {
        match slot {
            LinkSlot::Registry => &self.registry_link,
            LinkSlot::Active => &self.active_link,
        }
    }

    pub(crate) fn link_mut(&mut self, slot: LinkSlot) -> &mut Link {
        match slot {
            LinkSlot::Registry => &mut self.registry_link,
            LinkSlot::Active => &mut self.active_link,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn noop() -> Callback {
        Box::new(|_, _| {})
    }

    #[test]
    fn rejects_reserved_delivery_flags() {
        let ev = Event::io(0, EventFlags::READ | EventFlags::CANCELED, noop());
        assert!(matches!(
            ev.validate(),
            Err(EventideError::InvalidEvent(_))
        ));
        let ev = Event::io(0, EventFlags::READ | EventFlags::ERR, noop());
        assert!(ev.validate().is_err());
    }

    #[test]
    fn rejects_directionless_io() {
        let ev = Event::io(0, EventFlags::PERSIST, noop());
        assert!(ev.validate().is_err());
    }

    #[test]
    fn rejects_mixed_kinds() {
        let ev = Event::signal(1, EventFlags::READ, noop());
        assert!(ev.validate().is_err());
    }

    #[test]
    fn rejects_negative_fd_and_bad_signum() {
        assert!(Event::io(-1, EventFlags::READ, noop()).validate().is_err());
        assert!(Event::signal(0, EventFlags::empty(), noop())
            .validate()
            .is_err());
        assert!(Event::signal(4096, EventFlags::empty(), noop())
            .validate()
            .is_err());
    }

    #[test]
    fn rejects_unset_deadline() {
        let ev = Event::timer(TimeSpec::seconds(0), noop());
        assert!(ev.validate().is_err());
    }

    #[test]
    fn accepts_well_formed_events() {
        assert!(Event::io(0, EventFlags::READ | EventFlags::WRITE, noop())
            .validate()
            .is_ok());
        assert!(Event::signal(2, EventFlags::PERSIST, noop())
            .validate()
            .is_ok());
        assert!(Event::timer(TimeSpec::seconds(1), noop()).validate().is_ok());
    }
}
