//! Centralized error types for the Sonance core library.
//!
//! Every boundary of the toolkit reports failures through a single [`Error`]
//! enum, so that statuses can be compared, logged and forwarded across the
//! pipeline, control and network layers without conversion noise.

use thiserror::Error;

/// Status codes used at the toolkit's boundaries.
///
/// Success is expressed as `Ok(..)` in the [`Result`] alias; everything
/// below is a non-success outcome. Most of these are expected conditions
/// (`Drain`, `WouldBlock`, `StreamEnd`) rather than hard errors.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Allocation from a fixed-size pool failed.
    #[error("no memory in pool")]
    NoMem,

    /// Non-blocking read found nothing; try again later.
    #[error("nothing to read")]
    Drain,

    /// Peer closed gracefully; no further data will arrive.
    #[error("end of stream")]
    StreamEnd,

    /// No suitable I/O backend driver.
    #[error("no driver")]
    NoDriver,

    /// Backend driver found no such device.
    #[error("no device")]
    NoDevice,

    /// Socket operation can't complete without blocking.
    #[error("operation would block")]
    WouldBlock,

    /// Unrecoverable I/O or protocol error; the affected object is failed.
    #[error("unrecoverable failure")]
    Failure,

    /// Malformed input that could not be parsed.
    #[error("malformed data")]
    BadPacket,

    /// Invalid argument or configuration value.
    #[error("invalid argument")]
    BadArgument,
}

impl Error {
    /// Returns a machine-readable code for logs and metrics.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoMem => "no_mem",
            Self::Drain => "drain",
            Self::StreamEnd => "stream_end",
            Self::NoDriver => "no_driver",
            Self::NoDevice => "no_device",
            Self::WouldBlock => "would_block",
            Self::Failure => "failure",
            Self::BadPacket => "bad_packet",
            Self::BadArgument => "bad_argument",
        }
    }
}

/// Convenient Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;
