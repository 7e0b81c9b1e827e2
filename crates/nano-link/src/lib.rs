//! Debug Target Link
//!
//! This crate discovers serial debug targets, validates them, and keeps a
//! single connection to one of them across hot-plug, host suspend/resume and
//! permission changes.
//!
//! # Architecture
//!
//! - `ConnectionManager` owns the only open transport and mediates open/close
//! - `DiscoveryManager` classifies candidates and publishes confirmed devices
//! - the discovery actor serializes watcher events and client commands
//! - every notification goes out through a unified `LinkEvent` stream
//!
//! Watchers and transports come from `nano-detect`; any
//! `DeviceEnumerator`/`PortOpener` pair works, including the virtual bus in
//! `nano-sim`.

pub mod actor;
pub mod candidate;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod events;

pub use actor::{
    handle_watcher_event, run_discovery_actor, DiscoveryCommand, DiscoveryHandle, WatcherSummary,
};
pub use candidate::{
    CandidateDevice, CandidateSnapshot, CandidateState, ConfirmedDevice, InvalidTransition,
    Transition,
};
pub use config::DiscoveryConfig;
pub use connection::{AccessStatus, ActiveLink, ConnectionManager, LifecycleSignal};
pub use discovery::DiscoveryManager;
pub use error::LinkError;
pub use events::LinkEvent;
