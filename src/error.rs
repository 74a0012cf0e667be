use std::io;
use thiserror::Error;

/// The error type used by this crate.
///
/// Every variant is fatal to the operation that produced it; the binaries
/// map any of them to a log message and a non-zero exit.
#[derive(Debug, Error)]
pub enum Error {
    /// A malformed S-record line.
    #[error("{0}")]
    Record(String),

    /// A firmware file that failed validation, with the offending line.
    #[error("Line {line}: {reason}")]
    Firmware { line: usize, reason: String },

    /// An address or size outside the banked flash window.
    #[error("{0}")]
    Range(String),

    /// The OS write timed out or the device stopped answering.
    #[error("{0}")]
    Timeout(String),

    /// The device answered with something other than the expected reply.
    #[error("{0}")]
    Protocol(String),

    /// Flash readback after programming did not match what was written.
    #[error("verification failed @ 0x{0:04x}")]
    Verify(u16),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Serial(#[from] serialport::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
