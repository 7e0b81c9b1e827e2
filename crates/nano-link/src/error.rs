//! Error types for discovery and connection management

use nano_detect::{AccessDenial, OpenError, TransportError, ValidationError};
use thiserror::Error;

/// Errors surfaced by the connection manager and discovery service
#[derive(Debug, Error)]
pub enum LinkError {
    /// Transport could not be acquired (missing or in use)
    #[error("transport unavailable on {port}: {reason}")]
    TransportUnavailable { port: String, reason: String },

    /// Access to the transport was denied
    #[error("access to {port} denied {denial}")]
    AccessDenied { port: String, denial: AccessDenial },

    /// Unclassified failure while opening
    #[error("unexpected failure opening {port}: {reason}")]
    Unexpected { port: String, reason: String },

    /// Send or receive without a bound transport
    #[error("no transport connected")]
    NotConnected,

    /// Transport I/O failed
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Ping handshake failed
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Discovery actor is no longer running
    #[error("discovery service stopped")]
    ServiceStopped,
}

impl LinkError {
    /// True for failures the core absorbs and only logs
    pub fn is_expected(&self) -> bool {
        !matches!(self, LinkError::Unexpected { .. } | LinkError::ServiceStopped)
    }
}

impl From<OpenError> for LinkError {
    fn from(err: OpenError) -> Self {
        match err {
            OpenError::Unavailable { port, reason } => {
                LinkError::TransportUnavailable { port, reason }
            }
            OpenError::AccessDenied { port, denial } => LinkError::AccessDenied { port, denial },
            OpenError::Unexpected { port, reason } => LinkError::Unexpected { port, reason },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_error_classification_is_kept() {
        let err: LinkError = OpenError::AccessDenied {
            port: "/dev/ttyACM0".into(),
            denial: AccessDenial::ByUser,
        }
        .into();
        assert!(matches!(
            err,
            LinkError::AccessDenied {
                denial: AccessDenial::ByUser,
                ..
            }
        ));
        assert!(err.is_expected());

        let err: LinkError = OpenError::Unexpected {
            port: "/dev/ttyACM0".into(),
            reason: "invalid baud".into(),
        }
        .into();
        assert!(!err.is_expected());
    }
}
