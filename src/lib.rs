// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
//! # Eventide - a callback-based event reactor for Linux
//!
//! Eventide multiplexes three kinds of readiness onto user-supplied
//! callbacks from a single thread: file-descriptor readiness, POSIX
//! signal delivery, and monotonic timer expiration. It is the runtime
//! foundation on which a process builds non-blocking network services
//! and deadline-driven work.
//!
//! All three sources collapse into one wait primitive: the reactor owns
//! an `epoll` instance and routes signals and timers through their
//! `signalfd` and `timerfd` counterparts, so blocking, readiness fan-out
//! and cancellation are all one system call away. This makes the crate
//! Linux-only by design.
//!
//! ## Events
//!
//! An [`Event`] describes what to watch and what to call:
//!
//! * [`Event::io`] watches a file descriptor for `READ` and/or `WRITE`
//!   readiness, optionally edge-triggered.
//! * [`Event::signal`] watches a POSIX signal. The reactor blocks the
//!   signal process-wide while at least one event watches it and reads
//!   delivery through a `signalfd`.
//! * [`Event::timer`] fires once at an absolute instant on the monotonic
//!   clock ([`monotonic_now`]).
//!
//! Events without [`EventFlags::PERSIST`] unbind after one firing;
//! persistent events stay registered until deleted or canceled. A timer
//! is always one-shot: re-arm it from its callback with
//! [`Reactor::rearm_timer`] for periodic behavior.
//!
//! ## Driving the reactor
//!
//! [`Reactor::run`] blocks for readiness and dispatches callbacks in
//! FIFO order until nothing is registered, a callback limit is reached,
//! or [`Reactor::stop`] is called; [`Reactor::poll`] does the same
//! without ever blocking. Callbacks receive the reactor and may mutate
//! any registration, including their own.
//!
//! ```
//! use eventide::{Event, EventFlags, Reactor};
//! use std::time::Duration;
//!
//! let mut reactor = Reactor::new().unwrap();
//! reactor
//!     .add(Event::timer_after(
//!         Duration::from_millis(5),
//!         Box::new(|_reactor, delivery| {
//!             assert!(delivery.flags.contains(EventFlags::TIMER));
//!         }),
//!     ))
//!     .unwrap();
//! assert_eq!(reactor.run(0).unwrap(), 1);
//! ```
//!
//! ## Threading model
//!
//! A reactor is owned and driven by exactly one thread; nothing is
//! internally synchronized and callbacks run on the driving thread. The
//! blocking wait can be broken from a callback with
//! [`Reactor::stop`], which writes an `eventfd` the reactor keeps
//! registered alongside its other descriptors.
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

mod error;
mod event;
mod free_list;
mod interrupter;
mod io_source;
mod list;
mod reactor;
mod signals;
mod sys;
mod timer_heap;
mod timers;

pub use crate::{
    error::{EventideError, Result},
    event::{Callback, Delivery, Event, EventFlags, EventId},
    reactor::{Builder, Reactor},
    sys::monotonic_now,
};

// Deadlines are expressed in the kernel's own currency; re-export the
// types so callers do not need a direct `nix` dependency.
pub use nix::sys::time::{TimeSpec, TimeValLike};
