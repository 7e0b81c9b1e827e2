//! Serial Debug Target Detection Library
//!
//! This crate finds serial endpoints that may host a debug target, opens
//! them, and validates them with the ping handshake.
//!
//! # Example
//!
//! ```rust,no_run
//! use nano_detect::{DeviceEnumerator, SerialPortEnumerator};
//! use nano_protocol::Selector;
//!
//! let enumerator = SerialPortEnumerator::new();
//! let ports = enumerator.enumerate(&Selector::new("usb")).unwrap();
//!
//! for port in ports {
//!     println!("Found port: {}", port);
//! }
//! ```

pub mod denylist;
pub mod error;
pub mod handshake;
pub mod scanner;
pub mod transport;
pub mod watcher;

pub use denylist::{Denylist, UsbId, DENIED_ID_PATTERNS};
pub use error::{AccessDenial, DetectError, OpenError, TransportError, ValidationError};
pub use handshake::{ping_port, PingConfig, ProbeError, TargetProber};
pub use scanner::{identity_from_port, DeviceEnumerator, PortClass, SerialPortEnumerator};
pub use transport::{AsyncStream, PortOpener, SerialPortOpener, TransportHandle};
pub use watcher::{
    DeviceWatcher, WatcherEvent, WatcherId, WatcherSet, WatcherState, WatcherStatus,
};
