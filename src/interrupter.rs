// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
//! Wakeup primitive: an eventfd the reactor keeps registered for
//! read-readiness. Writing the counter breaks the reactor out of a
//! blocking wait; it exists solely to implement `stop`.

use std::{
    fs::File,
    os::unix::io::{AsRawFd, FromRawFd, RawFd},
};

use log::error;
use nix::{
    errno::Errno,
    sys::eventfd::{eventfd, EfdFlags},
    unistd,
};

use crate::{error::Result, sys::drain_counter_fd};

#[derive(Debug)]
pub(crate) struct Interrupter {
    eventfd: File,
}

impl Interrupter {
    pub(crate) fn new() -> Result<Interrupter> {
        let fd = eventfd(0, EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK)?;
        Ok(Interrupter {
            eventfd: unsafe { File::from_raw_fd(fd) },
        })
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.eventfd.as_raw_fd()
    }

    /// Wake the reactor. Idempotent: wakeups coalesce in the eventfd
    /// counter until the next `drain`.
    pub(crate) fn interrupt(&self) -> Result<()> {
        let counter = 1u64.to_ne_bytes();
        loop {
            match unistd::write(self.fd(), &counter) {
                Ok(n) => {
                    debug_assert_eq!(n, counter.len());
                    return Ok(());
                }
                Err(Errno::EINTR) => continue,
                // The counter is saturated, which already keeps the fd
                // readable.
                Err(Errno::EAGAIN) => return Ok(()),
                Err(err) => {
                    error!("eventfd write failed: {}", err);
                    return Err(err.into());
                }
            }
        }
    }

    /// Consume outstanding wakeups until the descriptor would block.
    pub(crate) fn drain(&self) {
        drain_counter_fd(self.fd());
    }
}
