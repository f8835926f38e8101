//! Error types for KVSSD.

use crate::types::Zone;
use std::fmt;

/// The main error type for KVSSD operations.
#[derive(Debug)]
pub enum Error {
    /// A lock was poisoned (internal error)
    LockPoisoned,

    /// I/O error
    Io(std::io::Error),

    /// Serialization error while encoding a persisted record
    Serialization(String),

    /// A persisted record is malformed, truncated or fails its checksum
    Corruption(String),

    /// No free block is left in a zone, even after a forced garbage collection
    CapacityExhausted {
        /// Zone that ran out of blocks
        zone: Zone,
        /// Level the allocation was made for
        level: u32,
    },

    /// Rejected configuration value
    InvalidConfig(String),

    /// Invalid operation
    InvalidOperation(String),
}

impl Error {
    /// Returns true for the capacity-exhausted backpressure signal.
    pub fn is_capacity_exhausted(&self) -> bool {
        matches!(self, Error::CapacityExhausted { .. })
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::LockPoisoned => write!(f, "Lock poisoned"),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            Error::Corruption(msg) => write!(f, "Corrupt record: {}", msg),
            Error::CapacityExhausted { zone, level } => {
                write!(f, "Capacity exhausted: no free {} block for level {}", zone, level)
            }
            Error::InvalidConfig(msg) => write!(f, "Invalid configuration: {}", msg),
            Error::InvalidOperation(msg) => write!(f, "Invalid operation: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

/// A specialized `Result` type for KVSSD operations.
pub type Result<T> = std::result::Result<T, Error>;
