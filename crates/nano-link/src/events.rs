//! Unified event stream for discovery and connection activity
//!
//! Connection notifications (connected / about to close), discovery progress
//! and candidate classification all go out through one broadcast channel so
//! observers see them in the order they happened.

use std::sync::Arc;

use nano_protocol::{DeviceId, DeviceIdentity};

/// Event published by the connection manager and the discovery manager
#[derive(Debug, Clone)]
pub enum LinkEvent {
    // -------------------------------------------------------------------------
    // Connection lifecycle events
    // -------------------------------------------------------------------------
    /// A transport was opened and bound to a device
    DeviceConnected {
        /// Identity the transport is bound to
        identity: Arc<DeviceIdentity>,
    },

    /// The bound transport is about to be released
    DeviceAboutToClose {
        /// Identity the transport was bound to
        identity: Arc<DeviceIdentity>,
    },

    // -------------------------------------------------------------------------
    // Discovery events
    // -------------------------------------------------------------------------
    /// An enumeration cycle finished and the confirmed set was published
    DiscoveryComplete {
        /// Cycle number, incremented on every watcher start or resume
        cycle: u64,
        /// Number of confirmed devices after the cycle
        confirmed: usize,
    },

    /// A new candidate entered the tentative set
    CandidateAdded {
        identity: Arc<DeviceIdentity>,
    },

    /// A candidate was validated as a debug target
    DeviceConfirmed {
        identity: Arc<DeviceIdentity>,
        /// Human readable description gathered during validation
        description: String,
    },

    /// A candidate failed validation
    CandidateRejected {
        identity: Arc<DeviceIdentity>,
        /// Why validation failed
        reason: String,
    },

    /// A candidate's port could not be opened; it stays tentative and is
    /// retried on the next cycle, a new Added, or access being allowed
    CandidateDeferred {
        identity: Arc<DeviceIdentity>,
        reason: String,
    },

    /// A candidate left every collection because its endpoint disappeared
    DeviceRemoved {
        id: DeviceId,
    },

    /// An unexpected failure that was absorbed
    Error {
        /// Source of the error
        source: String,
        /// Error message
        message: String,
    },
}

impl LinkEvent {
    /// Check if this is a connection lifecycle event
    pub fn is_connection_lifecycle(&self) -> bool {
        matches!(
            self,
            LinkEvent::DeviceConnected { .. } | LinkEvent::DeviceAboutToClose { .. }
        )
    }

    /// Check if this is a candidate classification event
    pub fn is_classification(&self) -> bool {
        matches!(
            self,
            LinkEvent::DeviceConfirmed { .. } | LinkEvent::CandidateRejected { .. }
        )
    }

    /// Device id the event refers to, if any
    pub fn device_id(&self) -> Option<&DeviceId> {
        match self {
            LinkEvent::DeviceConnected { identity }
            | LinkEvent::DeviceAboutToClose { identity }
            | LinkEvent::CandidateAdded { identity }
            | LinkEvent::DeviceConfirmed { identity, .. }
            | LinkEvent::CandidateRejected { identity, .. }
            | LinkEvent::CandidateDeferred { identity, .. } => Some(identity.id()),
            LinkEvent::DeviceRemoved { id } => Some(id),
            LinkEvent::DiscoveryComplete { .. } | LinkEvent::Error { .. } => None,
        }
    }
}
