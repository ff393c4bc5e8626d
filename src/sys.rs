// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
use std::os::unix::io::RawFd;

use nix::{
    errno::Errno,
    sys::time::TimeSpec,
    time::{clock_gettime, ClockId},
    unistd,
};

/// The current instant on the monotonic clock, the time base for every
/// timer deadline.
pub fn monotonic_now() -> TimeSpec {
    clock_gettime(ClockId::CLOCK_MONOTONIC).expect("clock_gettime(CLOCK_MONOTONIC)")
}

/// Read a counter-style descriptor (eventfd, timerfd) until it reports
/// would-block, discarding the 8-byte counts.
pub(crate) fn drain_counter_fd(fd: RawFd) {
    let mut buf = [0u8; 8];
    loop {
        match unistd::read(fd, &mut buf) {
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(_) => return,
        }
    }
}
