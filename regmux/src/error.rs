//! Runtime-wide error taxonomy.
//!
//! A single error enum is shared by every surface of the runtime: register
//! programs, the trigger engine, fences, and the command channel. Each variant
//! maps onto a stable negative integer via [`Error::code`], which is what the
//! command channel reports in packet headers and what completion events carry.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Status code reported to completion fences and error events when a
/// transaction is canceled rather than failed. Positive so that it is
/// distinguishable from device error codes, which are all negative.
pub const CANCELLATION_CODE: i32 = 1;

/// Errors produced by the mediation runtime.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The referenced object (device, transaction, event, buffer) is unknown.
    #[error("object not found")]
    NotFound,

    /// A caller-supplied argument failed validation.
    #[error("invalid argument: {0}")]
    InvalidArg(String),

    /// An allocation or capacity reservation failed.
    #[error("allocation failed")]
    NoMemory,

    /// A size computation from caller-supplied counts overflowed.
    #[error("size computation overflowed")]
    Overflow,

    /// The device or a shared resource is busy.
    #[error("device or resource busy")]
    Busy,

    /// A polling register access exceeded its deadline.
    #[error("operation timed out")]
    Timeout,

    /// The fence has already been signaled; its status is final.
    #[error("fence already signaled")]
    AlreadySignaled,

    /// The fence descriptor does not refer to a live fence.
    #[error("bad fence descriptor {0}")]
    BadFd(i32),

    /// The operation is not supported by this device type.
    #[error("operation not supported on this device")]
    NotSupported,

    /// The device reported a fault (e.g. a memory page fault).
    #[error("device faulted with code {0}")]
    Faulted(i32),

    /// The operation was canceled before or during execution.
    #[error("operation canceled")]
    Canceled,

    /// A register assertion found the device in an unexpected state.
    #[error("invalid device state: {0}")]
    InvalidState(String),
}

impl Error {
    /// Stable integer code for this error, reported through the command
    /// channel and completion events. Values follow the errno convention.
    pub fn code(&self) -> i32 {
        match self {
            Error::NotFound => -2,
            Error::InvalidArg(_) => -22,
            Error::NoMemory => -12,
            Error::Overflow => -75,
            Error::Busy => -16,
            Error::Timeout => -110,
            Error::AlreadySignaled => -114,
            Error::BadFd(_) => -9,
            Error::NotSupported => -95,
            Error::Faulted(_) => -14,
            Error::Canceled => -125,
            Error::InvalidState(_) => -71,
        }
    }

    /// Code used when reporting this error as a transaction outcome.
    ///
    /// Cancellation is reported with the positive [`CANCELLATION_CODE`] so
    /// that fence waiters can tell "canceled upstream" apart from a device
    /// error, mirroring the command-channel convention.
    pub fn completion_code(&self) -> i32 {
        match self {
            Error::Canceled => CANCELLATION_CODE,
            other => other.code(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable_and_negative() {
        assert_eq!(Error::NotFound.code(), -2);
        assert_eq!(Error::InvalidArg("x".into()).code(), -22);
        assert_eq!(Error::Timeout.code(), -110);
        assert_eq!(Error::AlreadySignaled.code(), -114);
        assert_eq!(Error::BadFd(7).code(), -9);
        for e in [
            Error::NotFound,
            Error::NoMemory,
            Error::Overflow,
            Error::Busy,
            Error::NotSupported,
            Error::Faulted(-3),
            Error::Canceled,
            Error::InvalidState("s".into()),
        ] {
            assert!(e.code() < 0);
        }
    }

    #[test]
    fn cancellation_maps_to_positive_completion_code() {
        assert_eq!(Error::Canceled.completion_code(), CANCELLATION_CODE);
        assert_eq!(Error::Timeout.completion_code(), Error::Timeout.code());
    }

    #[test]
    fn display_mentions_the_descriptor() {
        let msg = format!("{}", Error::BadFd(42));
        assert!(msg.contains("42"));
    }
}
