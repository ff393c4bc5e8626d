// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience
//
// This product includes software developed at Datadog (https://www.datadoghq.com/). Copyright 2020 Datadog, Inc.
//
use nix::errno::Errno;
use thiserror::Error;

/// Result type alias that all eventide public API functions use.
pub type Result<T> = std::result::Result<T, EventideError>;

/// Composite error type for everything the reactor can report.
///
/// The variants form a small, closed error space: a failed system call
/// (with the errno preserved), a registration conflict, an unknown event
/// handle, and invalid event input.
#[derive(Error, Debug)]
pub enum EventideError {
    /// A system call failed; the wrapped [`Errno`] carries the detail.
    #[error("system call failed: {0}")]
    Sys(#[from] Errno),

    /// The registration conflicts with an existing one, e.g. a second
    /// event requesting a direction already taken on the same fd.
    #[error("registration conflicts with an existing event")]
    Exists,

    /// The event handle does not name a live registration in this reactor.
    #[error("event is not registered in this reactor")]
    NotExists,

    /// The event descriptor failed validation; the payload names the rule.
    #[error("invalid event: {0}")]
    InvalidEvent(&'static str),
}

impl EventideError {
    /// Whether this error is a registration conflict.
    pub fn is_exists(&self) -> bool {
        matches!(self, EventideError::Exists)
    }

    /// Whether this error reports an unknown event handle.
    pub fn is_not_exists(&self) -> bool {
        matches!(self, EventideError::NotExists)
    }
}
