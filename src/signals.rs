// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
//! Signal readiness source: a signalfd plus a per-signal reference
//! count. A signal joins the signalfd mask and the thread signal mask
//! while at least one event watches it, and leaves both when the last
//! watcher goes away. The caller's signal mask is snapshotted at
//! construction and restored at teardown, so the reactor's lifetime is
//! transparent to the rest of the program's signal handling.

use std::{convert::TryFrom, os::unix::io::{AsRawFd, RawFd}};

use log::{debug, error};
use nix::{
    errno::Errno,
    sys::{
        signal::{sigprocmask, SigSet, Signal, SigmaskHow},
        signalfd::{SfdFlags, SignalFd},
    },
};

use crate::{
    error::Result,
    event::{EventRecord, Kind, Membership},
    free_list::FreeList,
    list::ListHead,
};

/// Sized like the kernel's `_NSIG`; only signals nameable by
/// [`Signal`] are registrable, which `Event::validate` enforces.
const SIGNAL_TABLE: usize = 64;

pub(crate) struct SignalSource {
    sigfd: SignalFd,
    mask: SigSet,
    saved_mask: SigSet,
    refs: [u32; SIGNAL_TABLE],
}

impl SignalSource {
    pub(crate) fn new() -> Result<SignalSource> {
        let mut saved_mask = SigSet::empty();
        sigprocmask(SigmaskHow::SIG_BLOCK, None, Some(&mut saved_mask))?;

        let mask = SigSet::empty();
        let sigfd = SignalFd::with_flags(&mask, SfdFlags::SFD_CLOEXEC | SfdFlags::SFD_NONBLOCK)?;

        Ok(SignalSource {
            sigfd,
            mask,
            saved_mask,
            refs: [0; SIGNAL_TABLE],
        })
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.sigfd.as_raw_fd()
    }

    /// First watcher of `signum` adds it to the signalfd mask and blocks
    /// it; later watchers only bump the count.
    pub(crate) fn acquire(&mut self, signum: i32) -> Result<()> {
        let signal = Signal::try_from(signum).expect("validated signal number");

        if self.refs[signum as usize] == 0 {
            self.mask.add(signal);
            if let Err(err) = self.sigfd.set_mask(&self.mask) {
                self.mask.remove(signal);
                return Err(err.into());
            }

            let mut single = SigSet::empty();
            single.add(signal);
            if let Err(err) = sigprocmask(SigmaskHow::SIG_BLOCK, Some(&single), None) {
                self.mask.remove(signal);
                let _ = self.sigfd.set_mask(&self.mask);
                return Err(err.into());
            }
            debug!("signal {} blocked and watched", signum);
        }
        self.refs[signum as usize] += 1;
        Ok(())
    }

    /// Drop one watcher of `signum`; the last one removes it from the
    /// signalfd mask and unblocks it.
    pub(crate) fn release(&mut self, signum: i32) {
        let signal = Signal::try_from(signum).expect("validated signal number");
        debug_assert!(self.refs[signum as usize] > 0);

        self.refs[signum as usize] -= 1;
        if self.refs[signum as usize] == 0 {
            self.mask.remove(signal);
            self.sigfd
                .set_mask(&self.mask)
                .expect("signalfd mask update");

            let mut single = SigSet::empty();
            single.add(signal);
            sigprocmask(SigmaskHow::SIG_UNBLOCK, Some(&single), None)
                .expect("sigprocmask(SIG_UNBLOCK)");
            debug!("signal {} unblocked and unwatched", signum);
        }
    }

    /// Read queued siginfo records until would-block; every record fans
    /// out over the signal registry in insertion order, activating
    /// matching events or bumping their pending count when they are
    /// already active.
    pub(crate) fn drain(
        &mut self,
        slab: &mut FreeList<EventRecord>,
        sig_registry: &mut ListHead,
        active: &mut ListHead,
    ) -> Result<()> {
        loop {
            let siginfo = match self.sigfd.read_signal() {
                Ok(Some(siginfo)) => siginfo,
                Ok(None) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(err) => return Err(err.into()),
            };
            let signum = siginfo.ssi_signo as i32;

            for idx in sig_registry.snapshot(slab) {
                let (matches, already_active) = {
                    let record = &slab[idx];
                    let matches = match record.kind {
                        Kind::Signal { signum: watched } => watched == signum,
                        _ => false,
                    };
                    (
                        matches,
                        record.membership.contains(Membership::IN_ACTIVE),
                    )
                };
                if !matches {
                    continue;
                }

                if already_active {
                    slab[idx].pending += 1;
                } else {
                    {
                        let record = &mut slab[idx];
                        record.delivered = record.flags;
                        record.pending = 1;
                        record.membership.insert(Membership::IN_ACTIVE);
                    }
                    active.push_back(slab, idx);
                }
                debug!("signal event {:?} is active", idx);
            }
        }
    }
}

impl Drop for SignalSource {
    fn drop(&mut self) {
        if let Err(err) = sigprocmask(SigmaskHow::SIG_SETMASK, Some(&self.saved_mask), None) {
            error!("restoring the signal mask failed: {}", err);
        }
    }
}
