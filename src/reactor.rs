// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
//! The reactor: owns every registered event, drains readiness from the
//! three sources into the active list and dispatches callbacks in FIFO
//! order, applying persistence and cancellation rules after each one.

use std::fmt;

use log::{debug, error, warn};
use nix::sys::time::{TimeSpec, TimeValLike};

use crate::{
    error::{EventideError, Result},
    event::{Delivery, Event, EventFlags, EventId, EventRecord, Kind, Membership},
    free_list::{FreeList, Idx},
    interrupter::Interrupter,
    io_source::IoSource,
    list::{LinkSlot, ListHead},
    signals::SignalSource,
    timers::TimerSource,
};

/// Configures and creates a [`Reactor`].
///
/// The defaults match the reactor's historical sizing; the knobs only
/// pre-size internal tables, they never change behavior.
///
/// ```
/// use eventide::Builder;
///
/// let reactor = Builder::new().fd_table_slots(1024).build().unwrap();
/// # drop(reactor);
/// ```
#[derive(Debug, Clone)]
pub struct Builder {
    fd_table_slots: usize,
    readiness_batch: usize,
}

impl Default for Builder {
    fn default() -> Builder {
        Builder {
            fd_table_slots: 32,
            readiness_batch: 32,
        }
    }
}

impl Builder {
    /// Creates a builder with default sizing.
    pub fn new() -> Builder {
        Builder::default()
    }

    /// Initial size of the fd table; it still grows geometrically on
    /// demand.
    pub fn fd_table_slots(mut self, slots: usize) -> Builder {
        self.fd_table_slots = slots;
        self
    }

    /// Initial readiness batch size; a full batch still doubles it, up
    /// to the cap.
    pub fn readiness_batch(mut self, slots: usize) -> Builder {
        self.readiness_batch = slots;
        self
    }

    /// Creates the reactor: the signalfd, timerfd, epoll and interrupter
    /// descriptors, with the latter three carriers registered for
    /// edge-triggered read readiness. Any failure unwinds the
    /// descriptors acquired so far.
    pub fn build(self) -> Result<Reactor> {
        let signals = SignalSource::new()?;
        let timers = TimerSource::new()?;
        let io = IoSource::new(self.fd_table_slots, self.readiness_batch)?;
        let interrupter = Interrupter::new()?;

        io.register_carrier(signals.fd())?;
        io.register_carrier(timers.fd())?;
        io.register_carrier(interrupter.fd())?;

        Ok(Reactor {
            slab: FreeList::default(),
            registry: ListHead::new(LinkSlot::Registry),
            sig_registry: ListHead::new(LinkSlot::Registry),
            active: ListHead::new(LinkSlot::Active),
            signals,
            timers,
            io,
            interrupter,
            current: None,
            cb_cleaned: false,
            cb_canceled: false,
            cb_rearm: None,
        })
    }
}

/// A single-threaded event reactor.
///
/// One wait primitive (epoll) carries all three readiness sources: I/O
/// fds directly, signals through a signalfd, timers through a timerfd.
/// Ready events queue on an active list and their callbacks run in FIFO
/// order from [`poll`](Reactor::poll) or [`run`](Reactor::run), on the
/// thread driving the reactor.
///
/// ```
/// use eventide::{Event, Reactor};
/// use std::time::Duration;
///
/// let mut reactor = Reactor::new().unwrap();
/// reactor
///     .add(Event::timer_after(
///         Duration::from_millis(5),
///         Box::new(|_reactor, _delivery| println!("tick")),
///     ))
///     .unwrap();
/// // Runs the one callback, then returns: nothing is left registered.
/// assert_eq!(reactor.run(0).unwrap(), 1);
/// ```
pub struct Reactor {
    slab: FreeList<EventRecord>,
    /// I/O and timer events.
    registry: ListHead,
    /// Signal events, kept apart so signal fan-out only scans them.
    sig_registry: ListHead,
    active: ListHead,
    signals: SignalSource,
    timers: TimerSource,
    io: IoSource,
    interrupter: Interrupter,

    /// The event whose callback is running right now.
    current: Option<Idx<EventRecord>>,
    /// Trampoline state for in-callback self-mutation, observed after
    /// the callback returns.
    cb_cleaned: bool,
    cb_canceled: bool,
    cb_rearm: Option<TimeSpec>,
}

impl fmt::Debug for Reactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("Reactor { .. }")
    }
}

impl Reactor {
    /// Creates a reactor with default sizing. See [`Builder::build`].
    pub fn new() -> Result<Reactor> {
        Builder::new().build()
    }

    /// Registers an event. Validation failures and registration
    /// conflicts leave the reactor untouched. The returned handle stays
    /// valid until the event becomes unbound.
    pub fn add(&mut self, event: Event) -> Result<EventId> {
        event.validate()?;
        let Event {
            kind,
            mut flags,
            callback,
        } = event;

        if matches!(kind, Kind::Signal { .. }) && flags.contains(EventFlags::EDGE_TRIGGERED) {
            warn!("EDGE_TRIGGERED on a signal event is ignored");
            flags.remove(EventFlags::EDGE_TRIGGERED);
        }

        let idx = self.slab.alloc(EventRecord::new(kind, flags, callback));

        let setup = match kind {
            Kind::Signal { signum } => self.signals.acquire(signum),
            Kind::Timer { .. } => {
                let seq = self.timers.next_seq();
                match &mut self.slab[idx].kind {
                    Kind::Timer { seq: slot, .. } => *slot = seq,
                    _ => unreachable!(),
                }
                self.timers.insert(&mut self.slab, idx);
                Ok(())
            }
            Kind::Io { .. } => self.io.add(&mut self.slab, idx),
        };
        if let Err(err) = setup {
            self.slab.dealloc(idx);
            return Err(err);
        }

        self.attach_registry(idx);
        debug!("event {:?} added", idx);
        Ok(EventId(idx))
    }

    /// Deletes an event without any further callback, unless called from
    /// inside the event's own callback, where deletion degrades to
    /// cancellation of the running invocation (the event is not put
    /// back).
    pub fn del(&mut self, id: EventId) -> Result<()> {
        let idx = id.0;
        if self.current == Some(idx) {
            debug!("event {:?} deleted from inside its callback", idx);
            self.cancel_in_callback(idx);
            return Ok(());
        }
        if self.slab.get(idx).is_none() {
            return Err(EventideError::NotExists);
        }

        self.detach_registry(idx);
        if self.slab[idx].membership.contains(Membership::IN_ACTIVE) {
            self.active.remove(&mut self.slab, idx);
            self.slab[idx].membership.remove(Membership::IN_ACTIVE);
        }
        self.cleanup(idx);
        self.slab.dealloc(idx);
        debug!("event {:?} deleted", idx);
        Ok(())
    }

    /// Cancels an event: its callback runs exactly once more with
    /// `CANCELED` in the delivered flags (merged into a pending delivery
    /// if the event is already active), after which the event is
    /// unbound. From inside the event's own callback this behaves like
    /// [`del`](Reactor::del).
    pub fn cancel(&mut self, id: EventId) -> Result<()> {
        let idx = id.0;
        if self.current == Some(idx) {
            debug!("event {:?} canceled from inside its callback", idx);
            self.cancel_in_callback(idx);
            return Ok(());
        }
        if self.slab.get(idx).is_none() {
            return Err(EventideError::NotExists);
        }

        self.cancel_outside(idx);
        debug!("event {:?} canceled", idx);
        Ok(())
    }

    /// Dispatches ready events without blocking: drains whatever
    /// readiness is observable at zero timeout and invokes up to `limit`
    /// callbacks (0 meaning unlimited). Returns the number of callbacks
    /// run.
    pub fn poll(&mut self, limit: usize) -> Result<usize> {
        self.poll_impl(limit, false)
    }

    /// Like [`poll`](Reactor::poll), but blocks in the wait primitive
    /// when nothing is ready. Returns once `limit` callbacks have run,
    /// [`stop`](Reactor::stop) is called, or no events remain
    /// registered.
    pub fn run(&mut self, limit: usize) -> Result<usize> {
        self.poll_impl(limit, true)
    }

    /// Wakes the reactor out of a blocking [`run`](Reactor::run).
    /// Idempotent, and safe to call from inside a callback: the current
    /// batch of active events still drains before `run` returns.
    pub fn stop(&self) -> Result<()> {
        self.interrupter.interrupt()
    }

    /// Re-arms the timer event whose callback is currently running at a
    /// new absolute deadline, keeping it registered instead of unbinding
    /// it. This is how periodic timers are built; calling it anywhere
    /// but inside a timer callback fails. A deletion or cancellation
    /// from the same callback wins over the re-arm.
    pub fn rearm_timer(&mut self, deadline: TimeSpec) -> Result<()> {
        let idx = self
            .current
            .ok_or(EventideError::InvalidEvent("rearm_timer outside a callback"))?;
        if !matches!(self.slab[idx].kind, Kind::Timer { .. }) {
            return Err(EventideError::InvalidEvent(
                "rearm_timer on a non-timer event",
            ));
        }
        if deadline <= TimeSpec::seconds(0) {
            return Err(EventideError::InvalidEvent(
                "timer deadline must be a positive monotonic instant",
            ));
        }
        self.cb_rearm = Some(deadline);
        Ok(())
    }

    /// How many events are currently registered, across all kinds.
    pub fn registered_events(&self) -> usize {
        self.registry.len() + self.sig_registry.len()
    }

    fn attach_registry(&mut self, idx: Idx<EventRecord>) {
        let list = if self.slab[idx].is_signal() {
            &mut self.sig_registry
        } else {
            &mut self.registry
        };
        list.push_back(&mut self.slab, idx);
        self.slab[idx].membership.insert(Membership::IN_REGISTRY);
    }

    fn detach_registry(&mut self, idx: Idx<EventRecord>) {
        let list = if self.slab[idx].is_signal() {
            &mut self.sig_registry
        } else {
            &mut self.registry
        };
        list.remove(&mut self.slab, idx);
        self.slab[idx].membership.remove(Membership::IN_REGISTRY);
    }

    /// Undo an event's kernel-side setup: drop the signal mask
    /// reference, erase a pending timer, or rewrite the fd's epoll
    /// registration.
    fn cleanup(&mut self, idx: Idx<EventRecord>) {
        let kind = self.slab[idx].kind;
        match kind {
            Kind::Signal { signum } => self.signals.release(signum),
            Kind::Timer { .. } => self.timers.remove(&mut self.slab, idx),
            Kind::Io { .. } => self.io.del(&mut self.slab, idx),
        }
    }

    fn cancel_in_callback(&mut self, idx: Idx<EventRecord>) {
        if !self.cb_cleaned {
            self.cleanup(idx);
            self.cb_cleaned = true;
        }
        self.cb_canceled = true;
    }

    fn cancel_outside(&mut self, idx: Idx<EventRecord>) {
        if self.slab[idx].membership.contains(Membership::IN_ACTIVE) {
            self.slab[idx].delivered |= EventFlags::CANCELED;
        } else {
            {
                let record = &mut self.slab[idx];
                record.delivered = EventFlags::CANCELED;
                record.membership.insert(Membership::IN_ACTIVE);
            }
            self.active.push_back(&mut self.slab, idx);
        }
    }

    fn cancel_all(&mut self) {
        for idx in self.registry.snapshot(&self.slab) {
            self.cancel_outside(idx);
            debug!("event {:?} canceled by teardown", idx);
        }
        for idx in self.sig_registry.snapshot(&self.slab) {
            self.cancel_outside(idx);
            debug!("event {:?} canceled by teardown", idx);
        }
    }

    /// Runs one callback. The event leaves the registry before the
    /// callback is entered and is put back afterwards only if it
    /// persists and was not canceled; in-callback self-mutation is
    /// observed through the trampoline flags.
    fn invoke(&mut self, idx: Idx<EventRecord>) {
        self.detach_registry(idx);

        let (put_back, target, delivered, is_signal) = {
            let record = &self.slab[idx];
            let persist = record.flags.contains(EventFlags::PERSIST);
            let canceled = record.delivered.contains(EventFlags::CANCELED);
            (
                persist && !canceled,
                record.target(),
                record.delivered,
                record.is_signal(),
            )
        };

        if put_back {
            self.cb_cleaned = false;
        } else {
            self.cleanup(idx);
            self.cb_cleaned = true;
        }
        self.cb_canceled = false;
        self.cb_rearm = None;

        let mut callback = {
            let record = &mut self.slab[idx];
            record.membership.insert(Membership::IN_CALLBACK);
            record.callback.take().expect("registered event has a callback")
        };
        let delivery = Delivery {
            id: EventId(idx),
            target,
            flags: delivered,
        };

        self.current = Some(idx);
        callback(self, delivery);
        self.current = None;

        if let Some(deadline) = self.cb_rearm.take() {
            if !self.cb_canceled {
                let seq = self.timers.next_seq();
                {
                    let record = &mut self.slab[idx];
                    record.membership.remove(Membership::IN_CALLBACK);
                    record.callback = Some(callback);
                    record.delivered = EventFlags::empty();
                    record.pending = 0;
                    match &mut record.kind {
                        Kind::Timer {
                            deadline: slot,
                            seq: seq_slot,
                            ..
                        } => {
                            *slot = deadline;
                            *seq_slot = seq;
                        }
                        _ => unreachable!("rearm of a non-timer event"),
                    }
                }
                self.timers.insert(&mut self.slab, idx);
                self.attach_registry(idx);
                debug!("timer event {:?} re-armed", idx);
                return;
            }
        }

        if !put_back || self.cb_canceled {
            drop(callback);
            self.slab.dealloc(idx);
            debug!("event {:?} unbound", idx);
            return;
        }

        {
            let record = &mut self.slab[idx];
            record.membership.remove(Membership::IN_CALLBACK);
            record.callback = Some(callback);
        }
        self.attach_registry(idx);

        if is_signal {
            let pending = {
                let record = &mut self.slab[idx];
                record.pending = record.pending.saturating_sub(1);
                record.pending
            };
            if pending > 0 {
                {
                    let record = &mut self.slab[idx];
                    record.delivered = record.flags;
                    record.membership.insert(Membership::IN_ACTIVE);
                }
                self.active.push_back(&mut self.slab, idx);
                debug!("event {:?} is still active, pending={}", idx, pending);
            }
        }
    }

    fn poll_impl(&mut self, limit: usize, blocking: bool) -> Result<usize> {
        let mut executed = 0;

        loop {
            // 1. Drain the active list.
            while let Some(idx) = self.active.pop_front(&mut self.slab) {
                self.slab[idx].membership.remove(Membership::IN_ACTIVE);
                self.invoke(idx);
                executed += 1;
                if limit > 0 && executed == limit {
                    return Ok(executed);
                }
            }

            // 2. A blocking run with nothing registered has nothing left
            //    to wait for.
            if blocking && self.registry.is_empty() && self.sig_registry.is_empty() {
                debug!("event loop quits, no registered events");
                return Ok(executed);
            }

            // 3. Wait for readiness; zero timeout when polling.
            let reported = self.io.wait(if blocking { -1 } else { 0 })?;

            // 4. An interruption trumps everything else in the batch.
            let interrupter_token = self.interrupter.fd() as u64;
            if (0..reported).any(|i| self.io.batch_entry(i).0 == interrupter_token) {
                self.interrupter.drain();
                debug!("event loop interrupted");
                return Ok(executed);
            }

            // 5. Fan out by carrier.
            let signal_token = self.signals.fd() as u64;
            let timer_token = self.timers.fd() as u64;
            for i in 0..reported {
                let (token, kernel_events) = self.io.batch_entry(i);
                if token == signal_token {
                    self.signals
                        .drain(&mut self.slab, &mut self.sig_registry, &mut self.active)?;
                } else if token == timer_token {
                    self.timers.drain(&mut self.slab, &mut self.active);
                } else {
                    self.io.dispatch(
                        token as i32,
                        kernel_events,
                        &mut self.slab,
                        &mut self.active,
                    );
                }
            }

            // 6. A poll with no new readiness and nothing queued is done.
            if !blocking && reported == 0 && self.active.is_empty() {
                return Ok(executed);
            }

            self.io.grow_batch_if_full(reported);
        }
    }
}

impl Drop for Reactor {
    /// Teardown cancels every registered event and dispatches once so
    /// each callback observes `CANCELED` before the descriptors close
    /// and the signal mask is restored.
    fn drop(&mut self) {
        self.cancel_all();
        if let Err(err) = self.poll_impl(0, false) {
            error!("teardown dispatch failed: {}", err);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{event::Callback, sys::monotonic_now};
    use nix::sys::signal::{raise, Signal};
    use std::{
        cell::{Cell, RefCell},
        io::Write,
        os::unix::io::AsRawFd,
        os::unix::net::UnixStream,
        rc::Rc,
        time::{Duration, Instant},
    };

    fn noop() -> Callback {
        Box::new(|_, _| {})
    }

    fn in_millis(ms: i64) -> TimeSpec {
        monotonic_now() + TimeSpec::milliseconds(ms)
    }

    #[test]
    fn signal_event_fires_once_without_persist() {
        let mut reactor = Reactor::new().unwrap();
        let deliveries = Rc::new(RefCell::new(Vec::new()));

        let log = deliveries.clone();
        let id = reactor
            .add(Event::signal(
                Signal::SIGUSR1 as i32,
                EventFlags::empty(),
                Box::new(move |_, d| log.borrow_mut().push((d.target, d.flags))),
            ))
            .unwrap();

        raise(Signal::SIGUSR1).unwrap();
        assert_eq!(reactor.run(0).unwrap(), 1);

        let deliveries = deliveries.borrow();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].0, Signal::SIGUSR1 as i32);
        assert!(deliveries[0].1.contains(EventFlags::SIGNAL));
        assert!(!deliveries[0].1.contains(EventFlags::CANCELED));

        assert_eq!(reactor.registered_events(), 0);
        assert_eq!(reactor.slab.live(), 0);
        assert!(reactor.del(id).unwrap_err().is_not_exists());
    }

    #[test]
    fn standard_signals_coalesce_before_the_first_drain() {
        let mut reactor = Reactor::new().unwrap();
        let fired = Rc::new(Cell::new(0));

        let count = fired.clone();
        let id = reactor
            .add(Event::signal(
                Signal::SIGUSR2 as i32,
                EventFlags::PERSIST,
                Box::new(move |_, d| {
                    if !d.flags.contains(EventFlags::CANCELED) {
                        count.set(count.get() + 1);
                    }
                }),
            ))
            .unwrap();

        // A standard signal has a single pending bit: three raises
        // before the first read collapse into one delivery.
        raise(Signal::SIGUSR2).unwrap();
        raise(Signal::SIGUSR2).unwrap();
        raise(Signal::SIGUSR2).unwrap();

        assert_eq!(reactor.poll(0).unwrap(), 1);
        assert_eq!(fired.get(), 1);
        assert_eq!(reactor.registered_events(), 1);
        reactor.del(id).unwrap();
    }

    #[test]
    fn same_signum_events_fire_in_registration_order() {
        let mut reactor = Reactor::new().unwrap();
        let order = Rc::new(RefCell::new(Vec::new()));

        for tag in 0..2u32 {
            let order = order.clone();
            reactor
                .add(Event::signal(
                    Signal::SIGUSR1 as i32,
                    EventFlags::empty(),
                    Box::new(move |_, _| order.borrow_mut().push(tag)),
                ))
                .unwrap();
        }

        raise(Signal::SIGUSR1).unwrap();
        assert_eq!(reactor.run(0).unwrap(), 2);
        assert_eq!(*order.borrow(), vec![0, 1]);
        assert_eq!(reactor.registered_events(), 0);
    }

    #[test]
    fn persistent_signal_event_refires() {
        let mut reactor = Reactor::new().unwrap();
        let fired = Rc::new(Cell::new(0));
        let canceled = Rc::new(Cell::new(0));

        let count = fired.clone();
        let canceled_count = canceled.clone();
        reactor
            .add(Event::signal(
                Signal::SIGHUP as i32,
                EventFlags::PERSIST,
                Box::new(move |reactor, d| {
                    if d.flags.contains(EventFlags::CANCELED) {
                        canceled_count.set(canceled_count.get() + 1);
                        return;
                    }
                    count.set(count.get() + 1);
                    if count.get() < 3 {
                        raise(Signal::SIGHUP).unwrap();
                    } else {
                        reactor.stop().unwrap();
                    }
                }),
            ))
            .unwrap();

        raise(Signal::SIGHUP).unwrap();
        assert_eq!(reactor.run(0).unwrap(), 3);
        assert_eq!(fired.get(), 3);
        assert_eq!(reactor.registered_events(), 1);

        drop(reactor);
        assert_eq!(canceled.get(), 1);
    }

    #[test]
    fn self_cancel_inside_callback_unbinds_without_canceled_delivery() {
        let mut reactor = Reactor::new().unwrap();
        let deliveries = Rc::new(RefCell::new(Vec::new()));

        let log = deliveries.clone();
        let id = reactor
            .add(Event::signal(
                Signal::SIGUSR1 as i32,
                EventFlags::PERSIST,
                Box::new(move |reactor, d| {
                    log.borrow_mut().push(d.flags);
                    reactor.cancel(d.id).unwrap();
                }),
            ))
            .unwrap();

        raise(Signal::SIGUSR1).unwrap();
        assert_eq!(reactor.run(0).unwrap(), 1);

        let deliveries = deliveries.borrow();
        assert_eq!(deliveries.len(), 1);
        assert!(deliveries[0].contains(EventFlags::SIGNAL));
        assert!(!deliveries[0].contains(EventFlags::CANCELED));

        assert_eq!(reactor.registered_events(), 0);
        assert_eq!(reactor.slab.live(), 0);
        assert!(reactor.cancel(id).unwrap_err().is_not_exists());
    }

    #[test]
    fn cancel_before_activation_delivers_exactly_canceled() {
        let mut reactor = Reactor::new().unwrap();
        let deliveries = Rc::new(RefCell::new(Vec::new()));

        let log = deliveries.clone();
        let id = reactor
            .add(Event::signal(
                Signal::SIGUSR2 as i32,
                EventFlags::empty(),
                Box::new(move |_, d| log.borrow_mut().push(d.flags)),
            ))
            .unwrap();

        reactor.cancel(id).unwrap();
        assert_eq!(reactor.poll(0).unwrap(), 1);

        assert_eq!(*deliveries.borrow(), vec![EventFlags::CANCELED]);
        assert!(reactor.cancel(id).unwrap_err().is_not_exists());
    }

    #[test]
    fn del_outside_callback_is_silent() {
        let mut reactor = Reactor::new().unwrap();
        let fired = Rc::new(Cell::new(0));

        let count = fired.clone();
        let id = reactor
            .add(Event::signal(
                Signal::SIGUSR1 as i32,
                EventFlags::empty(),
                Box::new(move |_, _| count.set(count.get() + 1)),
            ))
            .unwrap();

        reactor.del(id).unwrap();
        assert_eq!(reactor.poll(0).unwrap(), 0);
        assert_eq!(fired.get(), 0);
        assert!(reactor.del(id).unwrap_err().is_not_exists());
    }

    #[test]
    fn timers_fire_in_deadline_order() {
        let mut reactor = Reactor::new().unwrap();
        let order = Rc::new(RefCell::new(Vec::new()));
        let started = Instant::now();

        for (tag, ms) in [(0u32, 60i64), (1, 120)] {
            let order = order.clone();
            reactor
                .add(Event::timer(
                    in_millis(ms),
                    Box::new(move |_, d| {
                        assert!(d.flags.contains(EventFlags::TIMER));
                        assert_eq!(d.target, -1);
                        order.borrow_mut().push(tag);
                    }),
                ))
                .unwrap();
        }

        assert_eq!(reactor.run(0).unwrap(), 2);
        assert_eq!(*order.borrow(), vec![0, 1]);
        assert!(started.elapsed() >= Duration::from_millis(110));
        assert_eq!(reactor.registered_events(), 0);
    }

    #[test]
    fn equal_deadlines_fire_in_insertion_order() {
        let mut reactor = Reactor::new().unwrap();
        let order = Rc::new(RefCell::new(Vec::new()));
        let deadline = in_millis(30);

        for tag in 0..3u32 {
            let order = order.clone();
            reactor
                .add(Event::timer(
                    deadline,
                    Box::new(move |_, _| order.borrow_mut().push(tag)),
                ))
                .unwrap();
        }

        assert_eq!(reactor.run(0).unwrap(), 3);
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn deleting_a_pending_timer_reprograms_the_timerfd() {
        let mut reactor = Reactor::new().unwrap();
        let fired = Rc::new(Cell::new(0));

        let count = fired.clone();
        reactor
            .add(Event::timer(
                in_millis(50),
                Box::new(move |_, _| count.set(count.get() + 1)),
            ))
            .unwrap();
        let far = reactor
            .add(Event::timer(in_millis(10_000), noop()))
            .unwrap();

        assert_eq!(reactor.timers.heap_len(), 2);
        reactor.del(far).unwrap();
        assert_eq!(reactor.timers.heap_len(), 1);

        let started = Instant::now();
        assert_eq!(reactor.run(0).unwrap(), 1);
        assert_eq!(fired.get(), 1);
        // Returned at the surviving timer's deadline, not the deleted one's.
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(reactor.timers.heap_len(), 0);
    }

    #[test]
    fn canceling_a_pending_timer_from_a_callback_delivers_canceled() {
        let mut reactor = Reactor::new().unwrap();
        let timer_deliveries = Rc::new(RefCell::new(Vec::new()));

        let log = timer_deliveries.clone();
        let timer = reactor
            .add(Event::timer(
                in_millis(10_000),
                Box::new(move |_, d| log.borrow_mut().push(d.flags)),
            ))
            .unwrap();

        reactor
            .add(Event::signal(
                Signal::SIGUSR2 as i32,
                EventFlags::empty(),
                Box::new(move |reactor, _| reactor.cancel(timer).unwrap()),
            ))
            .unwrap();

        raise(Signal::SIGUSR2).unwrap();
        let started = Instant::now();
        assert_eq!(reactor.run(0).unwrap(), 2);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(*timer_deliveries.borrow(), vec![EventFlags::CANCELED]);
        assert_eq!(reactor.registered_events(), 0);
    }

    #[test]
    fn canceling_an_expired_undispatched_timer_merges_canceled() {
        let mut reactor = Reactor::new().unwrap();
        let deliveries = Rc::new(RefCell::new(Vec::new()));

        reactor.add(Event::timer(in_millis(5), noop())).unwrap();
        let log = deliveries.clone();
        let target = reactor
            .add(Event::timer(
                in_millis(10),
                Box::new(move |_, d| log.borrow_mut().push(d.flags)),
            ))
            .unwrap();

        std::thread::sleep(Duration::from_millis(30));
        // Both timers expire into the active list; the limit stops
        // dispatch after the first, leaving the second active but not
        // yet delivered.
        assert_eq!(reactor.run(1).unwrap(), 1);
        assert!(deliveries.borrow().is_empty());

        reactor.cancel(target).unwrap();
        assert_eq!(reactor.poll(0).unwrap(), 1);
        // One delivery carrying both the expiry and the cancellation.
        assert_eq!(
            *deliveries.borrow(),
            vec![EventFlags::TIMER | EventFlags::CANCELED]
        );
        assert_eq!(reactor.registered_events(), 0);
        assert_eq!(reactor.slab.live(), 0);
    }

    #[test]
    fn rearming_builds_a_periodic_timer() {
        let mut reactor = Reactor::new().unwrap();
        let fired = Rc::new(Cell::new(0));
        let started = Instant::now();

        let count = fired.clone();
        reactor
            .add(Event::timer(
                in_millis(20),
                Box::new(move |reactor, _| {
                    count.set(count.get() + 1);
                    if count.get() < 3 {
                        reactor.rearm_timer(in_millis(20)).unwrap();
                    }
                }),
            ))
            .unwrap();

        assert_eq!(reactor.run(0).unwrap(), 3);
        assert_eq!(fired.get(), 3);
        assert!(started.elapsed() >= Duration::from_millis(55));
        assert_eq!(reactor.registered_events(), 0);
    }

    #[test]
    fn cancellation_inside_the_callback_wins_over_rearm() {
        let mut reactor = Reactor::new().unwrap();
        let deliveries = Rc::new(RefCell::new(Vec::new()));

        let log = deliveries.clone();
        reactor
            .add(Event::timer(
                in_millis(10),
                Box::new(move |reactor, d| {
                    log.borrow_mut().push(d.flags);
                    reactor.rearm_timer(in_millis(10)).unwrap();
                    reactor.cancel(d.id).unwrap();
                }),
            ))
            .unwrap();

        // The in-callback cancellation discards the re-arm: the one
        // in-flight delivery is the last, nothing goes back into the
        // heap or registry.
        assert_eq!(reactor.run(0).unwrap(), 1);
        assert_eq!(*deliveries.borrow(), vec![EventFlags::TIMER]);
        assert_eq!(reactor.timers.heap_len(), 0);
        assert_eq!(reactor.registered_events(), 0);
        assert_eq!(reactor.slab.live(), 0);
    }

    #[test]
    fn deletion_inside_the_callback_wins_over_rearm() {
        let mut reactor = Reactor::new().unwrap();
        let fired = Rc::new(Cell::new(0));

        let count = fired.clone();
        let id = reactor
            .add(Event::timer(
                in_millis(10),
                Box::new(move |reactor, d| {
                    count.set(count.get() + 1);
                    reactor.rearm_timer(in_millis(10)).unwrap();
                    reactor.del(d.id).unwrap();
                }),
            ))
            .unwrap();

        assert_eq!(reactor.run(0).unwrap(), 1);
        assert_eq!(fired.get(), 1);
        assert_eq!(reactor.timers.heap_len(), 0);
        assert_eq!(reactor.registered_events(), 0);
        assert_eq!(reactor.slab.live(), 0);
        assert!(reactor.del(id).unwrap_err().is_not_exists());
    }

    #[test]
    fn rearm_is_rejected_outside_timer_callbacks() {
        let mut reactor = Reactor::new().unwrap();
        assert!(reactor.rearm_timer(in_millis(10)).is_err());

        let rearm_result = Rc::new(RefCell::new(None));
        let slot = rearm_result.clone();
        reactor
            .add(Event::signal(
                Signal::SIGUSR1 as i32,
                EventFlags::empty(),
                Box::new(move |reactor, _| {
                    *slot.borrow_mut() = Some(reactor.rearm_timer(in_millis(10)).is_err());
                }),
            ))
            .unwrap();
        raise(Signal::SIGUSR1).unwrap();
        reactor.run(0).unwrap();
        assert_eq!(*rearm_result.borrow(), Some(true));
    }

    #[test]
    fn connect_completion_delivers_write_readiness() {
        use socket2::{Domain, Socket, Type};

        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let socket = Socket::new(Domain::IPV4, Type::STREAM, None).unwrap();
        socket.set_nonblocking(true).unwrap();
        if let Err(err) = socket.connect(&addr.into()) {
            assert_eq!(
                err.raw_os_error(),
                Some(nix::errno::Errno::EINPROGRESS as i32)
            );
        }

        let mut reactor = Reactor::new().unwrap();
        let deliveries = Rc::new(RefCell::new(Vec::new()));

        let log = deliveries.clone();
        reactor
            .add(Event::io(
                socket.as_raw_fd(),
                EventFlags::WRITE | EventFlags::EDGE_TRIGGERED,
                Box::new(move |_, d| log.borrow_mut().push(d.flags)),
            ))
            .unwrap();

        assert_eq!(reactor.run(0).unwrap(), 1);
        let deliveries = deliveries.borrow();
        assert!(deliveries[0].contains(EventFlags::WRITE));
        assert!(!deliveries[0].contains(EventFlags::ERR));
        assert!(socket.take_error().unwrap().is_none());
    }

    #[test]
    fn refused_connect_delivers_err() {
        use socket2::{Domain, Socket, Type};

        // Grab a port that is free, then close it again.
        let addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };

        let socket = Socket::new(Domain::IPV4, Type::STREAM, None).unwrap();
        socket.set_nonblocking(true).unwrap();
        let _ = socket.connect(&addr.into());

        let mut reactor = Reactor::new().unwrap();
        let deliveries = Rc::new(RefCell::new(Vec::new()));

        let log = deliveries.clone();
        reactor
            .add(Event::io(
                socket.as_raw_fd(),
                EventFlags::WRITE | EventFlags::EDGE_TRIGGERED,
                Box::new(move |_, d| log.borrow_mut().push(d.flags)),
            ))
            .unwrap();

        assert_eq!(reactor.run(0).unwrap(), 1);
        assert_eq!(*deliveries.borrow(), vec![EventFlags::ERR]);
        assert!(socket.take_error().unwrap().is_some());
    }

    #[test]
    fn read_and_write_halves_can_split_one_fd() {
        let (local, peer) = UnixStream::pair().unwrap();
        local.set_nonblocking(true).unwrap();
        let fd = local.as_raw_fd();

        let mut reactor = Reactor::new().unwrap();
        let reads = Rc::new(Cell::new(0));
        let writes = Rc::new(Cell::new(0));

        let count = reads.clone();
        let reader = reactor
            .add(Event::io(
                fd,
                EventFlags::READ | EventFlags::PERSIST,
                Box::new(move |_, d| {
                    if d.flags.contains(EventFlags::CANCELED) {
                        return;
                    }
                    let mut buf = [0u8; 16];
                    nix::unistd::read(d.target, &mut buf).unwrap();
                    count.set(count.get() + 1);
                }),
            ))
            .unwrap();

        let count = writes.clone();
        reactor
            .add(Event::io(
                fd,
                EventFlags::WRITE,
                Box::new(move |_, d| {
                    if !d.flags.contains(EventFlags::CANCELED) {
                        assert_eq!(d.flags, EventFlags::WRITE);
                        count.set(count.get() + 1);
                    }
                }),
            ))
            .unwrap();

        // The write direction is taken; a third event cannot claim it.
        assert!(reactor
            .add(Event::io(fd, EventFlags::WRITE, noop()))
            .unwrap_err()
            .is_exists());

        // Writable immediately, nothing to read yet.
        assert_eq!(reactor.poll(0).unwrap(), 1);
        assert_eq!((reads.get(), writes.get()), (0, 1));

        (&peer).write_all(b"x").unwrap();
        assert_eq!(reactor.poll(0).unwrap(), 1);
        assert_eq!((reads.get(), writes.get()), (1, 1));

        // The write half fired without PERSIST, so the direction is free
        // again.
        let rewrite = reactor.add(Event::io(fd, EventFlags::WRITE, noop())).unwrap();
        reactor.del(rewrite).unwrap();
        reactor.del(reader).unwrap();
        assert_eq!(reactor.registered_events(), 0);
    }

    #[test]
    fn dual_direction_event_is_scheduled_once() {
        let (local, peer) = UnixStream::pair().unwrap();
        local.set_nonblocking(true).unwrap();
        (&peer).write_all(b"x").unwrap();

        let mut reactor = Reactor::new().unwrap();
        let deliveries = Rc::new(RefCell::new(Vec::new()));

        let log = deliveries.clone();
        reactor
            .add(Event::io(
                local.as_raw_fd(),
                EventFlags::READ | EventFlags::WRITE,
                Box::new(move |_, d| log.borrow_mut().push(d.flags)),
            ))
            .unwrap();

        // Readable and writable at once: one delivery carrying both.
        assert_eq!(reactor.poll(0).unwrap(), 1);
        assert_eq!(
            *deliveries.borrow(),
            vec![EventFlags::READ | EventFlags::WRITE]
        );
        assert_eq!(reactor.registered_events(), 0);
    }

    #[test]
    fn stop_from_a_callback_drains_the_active_batch_first() {
        let mut reactor = Reactor::new().unwrap();
        let fired = Rc::new(Cell::new(0));

        for _ in 0..2 {
            let count = fired.clone();
            reactor
                .add(Event::signal(
                    Signal::SIGUSR1 as i32,
                    EventFlags::PERSIST,
                    Box::new(move |reactor, d| {
                        if d.flags.contains(EventFlags::CANCELED) {
                            return;
                        }
                        count.set(count.get() + 1);
                        reactor.stop().unwrap();
                    }),
                ))
                .unwrap();
        }

        raise(Signal::SIGUSR1).unwrap();
        // Both active callbacks run before the interruption returns.
        assert_eq!(reactor.run(0).unwrap(), 2);
        assert_eq!(fired.get(), 2);
        assert_eq!(reactor.registered_events(), 2);
    }

    #[test]
    fn limit_leaves_the_rest_of_the_active_list_queued() {
        let mut reactor = Reactor::new().unwrap();
        let order = Rc::new(RefCell::new(Vec::new()));

        for tag in 0..2u32 {
            let order = order.clone();
            reactor
                .add(Event::timer(
                    in_millis(5),
                    Box::new(move |_, _| order.borrow_mut().push(tag)),
                ))
                .unwrap();
        }
        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(reactor.run(1).unwrap(), 1);
        assert_eq!(*order.borrow(), vec![0]);

        assert_eq!(reactor.poll(0).unwrap(), 1);
        assert_eq!(*order.borrow(), vec![0, 1]);
    }

    #[test]
    fn run_returns_when_nothing_is_registered() {
        let mut reactor = Reactor::new().unwrap();
        assert_eq!(reactor.run(0).unwrap(), 0);
        assert_eq!(reactor.poll(0).unwrap(), 0);
    }

    #[test]
    fn poll_never_blocks_on_pending_events() {
        let mut reactor = Reactor::new().unwrap();
        reactor
            .add(Event::timer(in_millis(10_000), noop()))
            .unwrap();

        let started = Instant::now();
        assert_eq!(reactor.poll(0).unwrap(), 0);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn stale_ids_never_alias_reused_slots() {
        let mut reactor = Reactor::new().unwrap();

        let first = reactor.add(Event::timer(in_millis(10_000), noop())).unwrap();
        reactor.del(first).unwrap();
        assert!(reactor.del(first).unwrap_err().is_not_exists());
        assert!(reactor.cancel(first).unwrap_err().is_not_exists());

        // The record slot is reused, the handle is not.
        let second = reactor.add(Event::timer(in_millis(10_000), noop())).unwrap();
        assert_ne!(first, second);
        assert!(reactor.del(first).unwrap_err().is_not_exists());
        reactor.del(second).unwrap();
    }

    #[test]
    fn add_rejects_invalid_events_without_registering() {
        let mut reactor = Reactor::new().unwrap();

        assert!(matches!(
            reactor.add(Event::io(-1, EventFlags::READ, noop())),
            Err(EventideError::InvalidEvent(_))
        ));
        assert!(matches!(
            reactor.add(Event::io(0, EventFlags::PERSIST, noop())),
            Err(EventideError::InvalidEvent(_))
        ));
        assert!(matches!(
            reactor.add(Event::signal(4096, EventFlags::empty(), noop())),
            Err(EventideError::InvalidEvent(_))
        ));
        assert!(matches!(
            reactor.add(Event::timer(TimeSpec::seconds(0), noop())),
            Err(EventideError::InvalidEvent(_))
        ));
        assert_eq!(reactor.registered_events(), 0);
        assert_eq!(reactor.slab.live(), 0);
    }

    #[test]
    fn callbacks_can_register_new_events() {
        let mut reactor = Reactor::new().unwrap();
        let timer_fired = Rc::new(Cell::new(0));

        let count = timer_fired.clone();
        reactor
            .add(Event::signal(
                Signal::SIGUSR2 as i32,
                EventFlags::empty(),
                Box::new(move |reactor, _| {
                    let count = count.clone();
                    reactor
                        .add(Event::timer_after(
                            Duration::from_millis(10),
                            Box::new(move |_, _| count.set(count.get() + 1)),
                        ))
                        .unwrap();
                }),
            ))
            .unwrap();

        raise(Signal::SIGUSR2).unwrap();
        // The signal callback chains a timer; run keeps going until the
        // timer fires and the registry empties.
        assert_eq!(reactor.run(0).unwrap(), 2);
        assert_eq!(timer_fired.get(), 1);
    }

    #[test]
    fn teardown_cancels_everything_once() {
        let (local, _peer) = UnixStream::pair().unwrap();
        local.set_nonblocking(true).unwrap();

        let canceled = Rc::new(Cell::new(0));
        let mut reactor = Reactor::new().unwrap();

        let canceled_cb = || {
            let count = canceled.clone();
            Box::new(move |_: &mut Reactor, d: Delivery| {
                if d.flags.contains(EventFlags::CANCELED) {
                    count.set(count.get() + 1);
                }
            }) as Callback
        };

        reactor
            .add(Event::signal(
                Signal::SIGUSR1 as i32,
                EventFlags::empty(),
                canceled_cb(),
            ))
            .unwrap();
        reactor
            .add(Event::signal(
                Signal::SIGUSR2 as i32,
                EventFlags::PERSIST,
                canceled_cb(),
            ))
            .unwrap();
        reactor
            .add(Event::timer(in_millis(10_000), canceled_cb()))
            .unwrap();
        reactor
            .add(Event::io(
                local.as_raw_fd(),
                EventFlags::READ,
                canceled_cb(),
            ))
            .unwrap();

        drop(reactor);
        assert_eq!(canceled.get(), 4);
    }
}
