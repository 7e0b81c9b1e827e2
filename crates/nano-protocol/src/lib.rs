//! nanolink protocol library
//!
//! Plain data shared by every layer of the discovery pipeline:
//!
//! - **Identity**: `DeviceIdentity`, the opaque `Selector` that produced it, and
//!   helpers that pull USB vendor/product/serial fields and the `#NANO_<id>#`
//!   target marker out of a platform device id
//! - **Line settings**: the fixed serial parameters a debug target expects
//! - **Ping frames**: the constant header/payload pair used as a liveness probe
//!
//! Nothing in this crate performs I/O.
//!
//! # Example
//!
//! ```rust
//! use nano_protocol::{DeviceIdentity, Selector};
//!
//! let identity = DeviceIdentity::new(
//!     "USB#VID_2E8A&PID_000A#NANO_ABC123#/dev/ttyACM0",
//!     "ttyACM0",
//!     "/dev/ttyACM0",
//!     Selector::new("usb"),
//! )
//! .unwrap();
//!
//! assert_eq!(identity.target_marker(), Some("ABC123"));
//! assert_eq!(identity.usb_fields().map(|u| u.vid), Some(0x2E8A));
//! ```

pub mod error;
pub mod identity;
pub mod line;
pub mod ping;

pub use error::IdentityError;
pub use identity::{
    parse_usb_fields, target_marker, DeviceId, DeviceIdentity, Selector, UsbFields,
    ID_DELIMITER, TARGET_MARKER_PREFIX,
};
pub use line::{DataBits, FlowControl, LineSettings, Parity, StopBits};
pub use ping::{PING_HEADER, PING_PAYLOAD, PING_RESPONSE_LEN};
