//! Error handling module for the SAR engine

use core::fmt;
use alloc::string::{String, ToString};

/// Common error type used throughout the SAR engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Invalid argument
    InvalidArgument(String),
    /// Invalid state for the requested transition
    InvalidState(String),
    /// Circuit or packet not found
    NotFound(String),
    /// Requested mode not supported by the adapter
    Unsupported(String),
    /// Receiver cannot accept work right now
    Busy(String),
    /// Shared memory exhausted
    OutOfMemory,
    /// Not enough free ring slots
    InsufficientSlots,
    /// Adapter reset in progress
    ResetInProgress,
    /// Circuit is already closing
    Closing,
    /// Adapter hardware has failed
    HardwareFailure,
    /// Configuration error
    ConfigError(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            Error::NotFound(msg) => write!(f, "Not found: {}", msg),
            Error::Unsupported(msg) => write!(f, "Unsupported: {}", msg),
            Error::Busy(msg) => write!(f, "Resource busy: {}", msg),
            Error::OutOfMemory => write!(f, "Out of memory"),
            Error::InsufficientSlots => write!(f, "Insufficient ring slots"),
            Error::ResetInProgress => write!(f, "Reset in progress"),
            Error::Closing => write!(f, "Circuit is closing"),
            Error::HardwareFailure => write!(f, "Hardware failure"),
            Error::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

/// Result type for operations that can fail
pub type Result<T> = core::result::Result<T, Error>;

/// Creates a new invalid argument error
pub fn invalid_argument(msg: &str) -> Error {
    Error::InvalidArgument(msg.to_string())
}

/// Creates a new invalid state error
pub fn invalid_state(msg: &str) -> Error {
    Error::InvalidState(msg.to_string())
}

/// Creates a new not found error
pub fn not_found(msg: &str) -> Error {
    Error::NotFound(msg.to_string())
}

/// Creates a new unsupported error
pub fn unsupported(msg: &str) -> Error {
    Error::Unsupported(msg.to_string())
}

/// Creates a new busy error
pub fn busy(msg: &str) -> Error {
    Error::Busy(msg.to_string())
}

/// Creates a new configuration error
pub fn config_error(msg: &str) -> Error {
    Error::ConfigError(msg.to_string())
}
