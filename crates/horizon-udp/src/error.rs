//! Error types for the UDP socket service.

use std::io;

use crate::socket::SocketId;

/// Errors reported by socket operations and completion handles.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UdpError {
    /// No socket with the given id exists.
    #[error("No socket with socketId {0}")]
    NotFound(SocketId),

    /// The operation requires the socket to be bound first.
    #[error("Socket {0} is not bound yet")]
    NotBound(SocketId),

    /// The socket is in a state that does not allow the operation.
    #[error("Invalid socket state: {0}")]
    InvalidState(String),

    /// An address string could not be parsed or resolved.
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// OS-level socket failure.
    #[error("I/O error: {message}")]
    Io {
        /// Error kind of the underlying I/O error.
        kind: io::ErrorKind,
        /// Raw OS error code, if the OS reported one.
        code: Option<i32>,
        /// Human-readable description.
        message: String,
    },

    /// The operation was dropped before it produced a result.
    #[error("Operation was cancelled")]
    Cancelled,

    /// Waiting for a result exceeded the given deadline.
    #[error("Timed out waiting for the operation to complete")]
    TimedOut,
}

impl UdpError {
    /// Create an invalid state error.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }

    /// Create an invalid address error.
    pub fn invalid_address(message: impl Into<String>) -> Self {
        Self::InvalidAddress(message.into())
    }

    /// Raw OS error code if this is an I/O error that carries one.
    pub fn os_code(&self) -> Option<i32> {
        match self {
            Self::Io { code, .. } => *code,
            _ => None,
        }
    }
}

impl From<io::Error> for UdpError {
    fn from(err: io::Error) -> Self {
        Self::Io {
            kind: err.kind(),
            code: err.raw_os_error(),
            message: err.to_string(),
        }
    }
}

/// A specialized Result type for UDP socket operations.
pub type Result<T> = std::result::Result<T, UdpError>;
