//! Error types for AmneziaWG operations.

use awg_exec::CommandError;
use thiserror::Error;

/// Result type for AmneziaWG operations.
pub type Result<T> = std::result::Result<T, WireGuardError>;

/// Errors that can occur while handling keys, configuration or tooling.
#[derive(Debug, Error)]
pub enum WireGuardError {
    /// Invalid base64 encoding.
    #[error("invalid base64 encoding: {0}")]
    InvalidBase64(String),

    /// Invalid key length.
    #[error("invalid key length: expected 32, got {0}")]
    InvalidKeyLength(usize),

    /// MTU outside of the supported window.
    #[error("invalid MTU {mtu}: must be between {min} and {max}")]
    InvalidMtu {
        /// The rejected value.
        mtu: u16,
        /// Lowest accepted MTU.
        min: u16,
        /// Highest accepted MTU.
        max: u16,
    },

    /// Obfuscation parameters violate their numeric constraints.
    #[error("invalid obfuscation parameters: {0}")]
    InvalidObfuscation(String),

    /// The peer status dump did not have the expected shape.
    #[error("unexpected status output for {interface}: {message}")]
    StatusParse {
        /// Interface the dump was taken from.
        interface: String,
        /// Description of the problem.
        message: String,
    },

    /// An external tool failed.
    #[error("tool failure: {0}")]
    Command(#[from] CommandError),

    /// An I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<base64::DecodeError> for WireGuardError {
    fn from(err: base64::DecodeError) -> Self {
        Self::InvalidBase64(err.to_string())
    }
}
