//! Error types for detection, transport access and validation

use std::fmt;
use std::io;
use std::time::Duration;

use nano_protocol::IdentityError;
use thiserror::Error;

/// Errors that can occur during enumeration
#[derive(Debug, Error)]
pub enum DetectError {
    /// Failed to enumerate serial ports
    #[error("failed to enumerate ports: {0}")]
    EnumerationFailed(String),

    /// Enumerated port could not be turned into an identity
    #[error("invalid device identity: {0}")]
    Identity(#[from] IdentityError),

    /// Serial port error
    #[error("serial port error: {0}")]
    SerialPort(#[from] serialport::Error),
}

/// Who refused access to a port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessDenial {
    /// The user revoked or declined access
    ByUser,
    /// The system or a policy refused access
    BySystem,
}

impl fmt::Display for AccessDenial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessDenial::ByUser => f.write_str("by user"),
            AccessDenial::BySystem => f.write_str("by system"),
        }
    }
}

/// Classified failure to acquire a transport
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OpenError {
    /// Device missing, in use, or failing for an unknown reason
    #[error("port {port} is unavailable: {reason}")]
    Unavailable { port: String, reason: String },

    /// Access refused by the user or the system
    #[error("access to {port} denied {denial}")]
    AccessDenied { port: String, denial: AccessDenial },

    /// Anything the classification does not expect
    #[error("unexpected failure opening {port}: {reason}")]
    Unexpected { port: String, reason: String },
}

impl OpenError {
    /// Classify a serialport error raised while opening `port`
    pub fn from_serial(port: &str, err: &serialport::Error) -> Self {
        let port = port.to_string();
        let reason = err.description.clone();
        match err.kind() {
            serialport::ErrorKind::NoDevice => OpenError::Unavailable { port, reason },
            serialport::ErrorKind::Io(io::ErrorKind::PermissionDenied) => OpenError::AccessDenied {
                port,
                denial: AccessDenial::BySystem,
            },
            serialport::ErrorKind::Io(io::ErrorKind::NotFound) => {
                OpenError::Unavailable { port, reason }
            }
            serialport::ErrorKind::InvalidInput => OpenError::Unexpected { port, reason },
            _ => OpenError::Unavailable { port, reason },
        }
    }

    /// Port the failure refers to
    pub fn port(&self) -> &str {
        match self {
            OpenError::Unavailable { port, .. }
            | OpenError::AccessDenied { port, .. }
            | OpenError::Unexpected { port, .. } => port,
        }
    }

    /// True for failures the caller is expected to absorb
    pub fn is_expected(&self) -> bool {
        !matches!(self, OpenError::Unexpected { .. })
    }
}

/// Errors from byte I/O on a transport
#[derive(Debug, Error)]
pub enum TransportError {
    /// Operation did not finish in time
    #[error("{operation} timed out after {}ms", .after.as_millis())]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// Operation was cancelled, usually because the transport is closing
    #[error("operation cancelled")]
    Cancelled,

    /// Peer closed the stream
    #[error("transport closed by peer")]
    Closed,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// True if the error came from a cancellation rather than the device
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransportError::Cancelled)
    }
}

/// Reasons a ping did not validate a target
#[derive(Debug, Error)]
pub enum ValidationError {
    /// Nothing came back before the deadline
    #[error("no ping response within {}ms", .0.as_millis())]
    Timeout(Duration),

    /// Reply ended before the expected length
    #[error("short ping response: expected {expected} bytes, got {received}")]
    ShortRead { expected: usize, received: usize },

    /// Transport failed during the exchange
    #[error("transport error during ping: {0}")]
    Transport(#[from] TransportError),
}
