//! Debug Target Simulation Library
//!
//! This crate provides a simulation layer for exercising discovery without
//! physical hardware. It includes:
//!
//! - **VirtualPortBus**: enumerates and opens virtual ports, with hot-plug and
//!   open-fault injection
//! - **Virtual targets**: tasks that answer pings fully, partially or not at all
//!
//! # Example
//!
//! ```rust
//! use nano_detect::DeviceEnumerator;
//! use nano_protocol::Selector;
//! use nano_sim::{TargetBehavior, VirtualPortBus, VirtualPortConfig};
//!
//! let bus = VirtualPortBus::new();
//! bus.plug(VirtualPortConfig::nano_usb("/dev/ttyACM0", "ABC123")).unwrap();
//! bus.plug(VirtualPortConfig::plain("/dev/ttyUSB0", TargetBehavior::ShortReply(20))).unwrap();
//!
//! let ports = bus.enumerate(&Selector::new("usb")).unwrap();
//! assert_eq!(ports.len(), 2);
//! ```

pub mod bus;
pub mod target;

pub use bus::{OpenFault, SimError, VirtualPortBus, VirtualPortConfig};
pub use target::{reply_frame, run_virtual_target, TargetBehavior};
