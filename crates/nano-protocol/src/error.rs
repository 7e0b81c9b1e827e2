//! Error types for identity construction

use thiserror::Error;

/// Errors that can occur while building a device identity
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdentityError {
    /// The platform reported an empty device id
    #[error("device id is empty")]
    EmptyId,

    /// The port path needed to open the device is missing
    #[error("device {0} has no port path")]
    MissingPortPath(String),
}
