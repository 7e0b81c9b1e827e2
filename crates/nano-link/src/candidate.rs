//! Candidate device classification
//!
//! Every discovered endpoint becomes a `CandidateDevice`. Its classification
//! only moves through `CandidateState::apply`, so the allowed transitions can
//! be tested without any I/O:
//!
//! ```text
//! Tentative --Confirm--> Confirmed
//! Tentative --Reject---> Rejected
//! Confirmed --Reject---> Rejected
//! ```
//!
//! Rejected is terminal. A rejected endpoint only gets another chance after
//! it is removed and added again, which creates a fresh candidate.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use nano_detect::WatcherId;
use nano_protocol::DeviceIdentity;
use thiserror::Error;

/// Classification of a candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateState {
    Tentative,
    Confirmed,
    Rejected,
}

/// Input to the classification state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Validation succeeded
    Confirm,
    /// Open or validation failed
    Reject,
}

/// Transition not allowed from the current state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("cannot apply {transition:?} to a {from:?} candidate")]
pub struct InvalidTransition {
    pub from: CandidateState,
    pub transition: Transition,
}

impl CandidateState {
    /// Single transition function for candidate classification
    pub fn apply(self, transition: Transition) -> Result<CandidateState, InvalidTransition> {
        match (self, transition) {
            (CandidateState::Tentative, Transition::Confirm) => Ok(CandidateState::Confirmed),
            (CandidateState::Tentative, Transition::Reject)
            | (CandidateState::Confirmed, Transition::Reject) => Ok(CandidateState::Rejected),
            (from, transition) => Err(InvalidTransition { from, transition }),
        }
    }
}

impl fmt::Display for CandidateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CandidateState::Tentative => f.write_str("tentative"),
            CandidateState::Confirmed => f.write_str("confirmed"),
            CandidateState::Rejected => f.write_str("rejected"),
        }
    }
}

/// A discovered endpoint and what is known about it
#[derive(Debug, Clone)]
pub struct CandidateDevice {
    identity: Arc<DeviceIdentity>,
    state: CandidateState,
    description: Vec<String>,
    seen_by: BTreeSet<WatcherId>,
}

impl CandidateDevice {
    /// New tentative candidate reported by `watcher`
    pub fn new(identity: Arc<DeviceIdentity>, watcher: WatcherId) -> Self {
        let mut candidate = Self {
            description: vec![identity.display_name().to_string()],
            identity,
            state: CandidateState::Tentative,
            seen_by: BTreeSet::new(),
        };
        if let Some(serial) = candidate.identity.usb_fields().and_then(|u| u.serial) {
            candidate.describe(format!("serial {}", serial));
        }
        candidate.seen_by.insert(watcher);
        candidate
    }

    pub fn identity(&self) -> &Arc<DeviceIdentity> {
        &self.identity
    }

    pub fn state(&self) -> CandidateState {
        self.state
    }

    pub fn is_tentative(&self) -> bool {
        self.state == CandidateState::Tentative
    }

    pub fn is_confirmed(&self) -> bool {
        self.state == CandidateState::Confirmed
    }

    pub fn is_rejected(&self) -> bool {
        self.state == CandidateState::Rejected
    }

    /// Apply a classification transition
    pub fn transition(&mut self, transition: Transition) -> Result<CandidateState, InvalidTransition> {
        self.state = self.state.apply(transition)?;
        Ok(self.state)
    }

    /// Append a description fragment; duplicates are skipped
    pub fn describe(&mut self, fragment: impl Into<String>) {
        let fragment = fragment.into();
        if !fragment.is_empty() && !self.description.contains(&fragment) {
            self.description.push(fragment);
        }
    }

    /// Description assembled from every fragment gathered so far
    pub fn description(&self) -> String {
        self.description.join(", ")
    }

    /// Record another watcher reporting this endpoint
    pub fn add_watcher(&mut self, watcher: WatcherId) {
        self.seen_by.insert(watcher);
    }

    pub fn is_seen_by(&self, watcher: WatcherId) -> bool {
        self.seen_by.contains(&watcher)
    }

    /// Forget a watcher; returns true when no watcher reports the endpoint
    pub fn remove_watcher(&mut self, watcher: WatcherId) -> bool {
        self.seen_by.remove(&watcher);
        self.seen_by.is_empty()
    }
}

/// Published entry of the confirmed-device collection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmedDevice {
    pub identity: Arc<DeviceIdentity>,
    pub description: String,
}

/// Read-only view of a candidate for status queries
#[derive(Debug, Clone)]
pub struct CandidateSnapshot {
    pub identity: Arc<DeviceIdentity>,
    pub state: CandidateState,
    pub description: String,
}

impl From<&CandidateDevice> for CandidateSnapshot {
    fn from(candidate: &CandidateDevice) -> Self {
        Self {
            identity: candidate.identity.clone(),
            state: candidate.state,
            description: candidate.description(),
        }
    }
}
