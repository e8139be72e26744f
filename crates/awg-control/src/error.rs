//! Error types for the control plane.

use std::path::PathBuf;

use awg_wireguard::WireGuardError;
use thiserror::Error;

/// Result type for control-plane operations.
pub type Result<T> = std::result::Result<T, ControlError>;

/// Errors returned by control-plane operations.
///
/// None of these is fatal to a long-running process; each is reported for
/// the single operation that produced it.
#[derive(Debug, Error)]
pub enum ControlError {
    /// Input rejected before any state was touched.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Unknown server id.
    #[error("server not found: {0}")]
    ServerNotFound(String),

    /// Unknown client id, or a client that belongs to another server.
    #[error("client not found: {0}")]
    ClientNotFound(String),

    /// The interface could not be brought up; the server stays stopped.
    #[error("failed to bring up {interface}: {source}")]
    InterfaceUp {
        /// Interface name.
        interface: String,
        /// Underlying tool failure.
        #[source]
        source: WireGuardError,
    },

    /// The interface could not be brought down; the server stays running.
    #[error("failed to bring down {interface}: {source}")]
    InterfaceDown {
        /// Interface name.
        interface: String,
        /// Underlying tool failure.
        #[source]
        source: WireGuardError,
    },

    /// The state document could not be written. The previous file is intact.
    #[error("failed to persist {}: {source}", path.display())]
    Persistence {
        /// Document path.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// The state document exists but cannot be read as a document.
    #[error("malformed state document {}: {message}", path.display())]
    MalformedDocument {
        /// Document path.
        path: PathBuf,
        /// Parser message.
        message: String,
    },

    /// Settings could not be loaded or are inconsistent.
    #[error("configuration error: {0}")]
    Config(String),

    /// An external tool or tunnel file operation failed.
    #[error(transparent)]
    Tool(#[from] WireGuardError),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ControlError {
    /// Create a validation error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Whether this is a not-found error of either kind.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ServerNotFound(_) | Self::ClientNotFound(_))
    }
}
