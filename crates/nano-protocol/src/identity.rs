//! Device identity and identity-string helpers
//!
//! Platform device ids look like `USB#VID_2E8A&PID_000A#NANO_ABC123#/dev/ttyACM0`:
//! `#`-delimited segments, a `VID_xxxx&PID_yyyy` segment for USB devices and,
//! for boards that announce themselves, a `NANO_<marker>` segment.

use std::fmt;

use crate::error::IdentityError;

/// Segment delimiter in platform device ids
pub const ID_DELIMITER: char = '#';

/// Prefix of the segment a debug target uses to identify itself
pub const TARGET_MARKER_PREFIX: &str = "NANO_";

/// Opaque filter used to request enumeration of a class of endpoints
///
/// Only the platform enumerator interprets the contents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct Selector(String);

impl Selector {
    /// Create a selector from any string token
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Get the raw token
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Platform device id, unique per physical interface
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct DeviceId(String);

impl DeviceId {
    /// Wrap a raw platform id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the raw id string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of an enumerated serial endpoint
///
/// Produced by enumeration and never mutated afterwards. Components share it
/// behind an `Arc` rather than copying it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceIdentity {
    id: DeviceId,
    display_name: String,
    port_path: String,
    selector: Selector,
}

impl DeviceIdentity {
    /// Build an identity, rejecting empty ids and port paths
    pub fn new(
        id: impl Into<String>,
        display_name: impl Into<String>,
        port_path: impl Into<String>,
        selector: Selector,
    ) -> Result<Self, IdentityError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(IdentityError::EmptyId);
        }
        let port_path = port_path.into();
        if port_path.trim().is_empty() {
            return Err(IdentityError::MissingPortPath(id));
        }
        Ok(Self {
            id: DeviceId(id),
            display_name: display_name.into(),
            port_path,
            selector,
        })
    }

    /// Platform device id
    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    /// Human-readable name
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Path the transport opens (e.g. `/dev/ttyACM0`, `COM7`)
    pub fn port_path(&self) -> &str {
        &self.port_path
    }

    /// Selector of the watcher that reported this device
    pub fn selector(&self) -> &Selector {
        &self.selector
    }

    /// USB vendor/product/serial fields, if the id carries them
    pub fn usb_fields(&self) -> Option<UsbFields> {
        parse_usb_fields(self.id.as_str())
    }

    /// Target marker announced in the id, if any
    pub fn target_marker(&self) -> Option<&str> {
        target_marker(self.id.as_str())
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.display_name, self.port_path)
    }
}

/// USB fields decoded from a device id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbFields {
    /// USB Vendor ID
    pub vid: u16,
    /// USB Product ID
    pub pid: u16,
    /// Serial number segment following the VID/PID segment
    pub serial: Option<String>,
}

/// Decode the `VID_xxxx&PID_yyyy` segment (and the serial after it)
///
/// Matching is case-insensitive. Returns `None` when the id carries no
/// parseable VID/PID pair.
pub fn parse_usb_fields(id: &str) -> Option<UsbFields> {
    let segments: Vec<&str> = id.split(ID_DELIMITER).collect();
    let (index, segment) = segments
        .iter()
        .enumerate()
        .find(|(_, s)| s.to_ascii_uppercase().contains("VID_"))?;

    let upper = segment.to_ascii_uppercase();
    let vid = hex_field(&upper, "VID_")?;
    let pid = hex_field(&upper, "PID_")?;

    let serial = segments
        .get(index + 1)
        .filter(|s| !s.is_empty() && !s.starts_with('{') && !s.starts_with('/'))
        .map(|s| s.to_string());

    Some(UsbFields { vid, pid, serial })
}

fn hex_field(segment: &str, key: &str) -> Option<u16> {
    let start = segment.find(key)? + key.len();
    let digits = segment.get(start..start + 4)?;
    u16::from_str_radix(digits, 16).ok()
}

/// Extract the marker from a `#NANO_<marker>#` segment
///
/// Only segments enclosed by delimiters on both sides count; an id without
/// that structure is not self-identifying.
pub fn target_marker(id: &str) -> Option<&str> {
    let segments: Vec<&str> = id.split(ID_DELIMITER).collect();
    if segments.len() < 3 {
        return None;
    }
    segments[1..segments.len() - 1]
        .iter()
        .find_map(|s| s.strip_prefix(TARGET_MARKER_PREFIX))
        .filter(|marker| !marker.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usb_identity(id: &str) -> DeviceIdentity {
        DeviceIdentity::new(id, "ttyACM0", "/dev/ttyACM0", Selector::new("usb")).unwrap()
    }

    #[test]
    fn test_marker_between_delimiters() {
        let identity = usb_identity("USB#VID_2E8A&PID_000A#NANO_ABC123#/dev/ttyACM0");
        assert_eq!(identity.target_marker(), Some("ABC123"));
    }

    #[test]
    fn test_marker_requires_closing_delimiter() {
        assert_eq!(target_marker("USB#VID_2E8A&PID_000A#NANO_ABC123"), None);
        assert_eq!(target_marker("NANO_ABC123"), None);
        assert_eq!(target_marker("USB#NANO_#x"), None);
    }

    #[test]
    fn test_marker_windows_style_id() {
        let id = r"\\?\USB#VID_0483&PID_5740#NANO_3C5D1F#{86e0d1e0-8089-11d0-9ce4-08003e301f73}";
        assert_eq!(target_marker(id), Some("3C5D1F"));
    }

    #[test]
    fn test_usb_fields() {
        let fields = parse_usb_fields("USB#VID_0403&PID_6001#A50285BI#/dev/ttyUSB0").unwrap();
        assert_eq!(fields.vid, 0x0403);
        assert_eq!(fields.pid, 0x6001);
        assert_eq!(fields.serial.as_deref(), Some("A50285BI"));
    }

    #[test]
    fn test_usb_fields_lowercase_without_serial() {
        let fields = parse_usb_fields(r"\\?\usb#vid_10c4&pid_ea60#{guid}").unwrap();
        assert_eq!(fields.vid, 0x10C4);
        assert_eq!(fields.pid, 0xEA60);
        assert_eq!(fields.serial, None);
    }

    #[test]
    fn test_usb_fields_absent() {
        assert_eq!(parse_usb_fields("PCI#/dev/ttyS0"), None);
        assert_eq!(parse_usb_fields("USB#VID_ZZZZ&PID_0001#x"), None);
    }

    #[test]
    fn test_identity_rejects_empty() {
        assert_eq!(
            DeviceIdentity::new("  ", "x", "/dev/x", Selector::new("usb")),
            Err(IdentityError::EmptyId)
        );
        assert!(matches!(
            DeviceIdentity::new("SERIAL#x", "x", "", Selector::new("usb")),
            Err(IdentityError::MissingPortPath(_))
        ));
    }
}
