// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime error taxonomy.

use std::io;

use thiserror::Error;

/// Errors surfaced by scheduler and socket operations.
///
/// Kernel failures keep their errno class inside `Io`. `WouldBlock` never
/// appears here — it is always converted into a suspension.
#[derive(Debug, Error)]
pub enum Error {
    /// A deadline fired while the task was parked.
    #[error("operation timed out")]
    Timeout,

    /// The scheduler is stopping; the task must unwind without issuing
    /// new blocking operations.
    #[error("operation cancelled by scheduler shutdown")]
    Cancelled,

    /// A buffer hit its hard size cap.
    #[error("buffer limit of {max} bytes exceeded")]
    Overflow { max: usize },

    /// `expect` saw a byte differing from the expected literal.
    #[error("unexpected byte at offset {offset}: got {got:#04x}, expected {expected:#04x}")]
    Mismatch {
        offset: usize,
        got: u8,
        expected: u8,
    },

    /// The peer closed the connection mid-operation.
    #[error("connection closed by peer")]
    Closed,

    /// Preserved kernel failure (connect refused, broken pipe, ...).
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// True when the error means "unwind now" rather than "operation failed".
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
