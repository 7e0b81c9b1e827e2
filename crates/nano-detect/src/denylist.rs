//! Static denylist of endpoints that are never debug targets
//!
//! Checked before any other processing so these ports are never opened.
//! Entries are id substrings (platform-internal buses) and USB VID/PID pairs
//! of Bluetooth radios that expose virtual serial ports.

use nano_protocol::DeviceIdentity;

/// USB Vendor ID / Product ID pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbId {
    pub vid: u16,
    pub pid: u16,
}

impl UsbId {
    pub const fn new(vid: u16, pid: u16) -> Self {
        Self { vid, pid }
    }
}

/// Bluetooth controllers whose virtual COM ports show up as USB serial
pub mod bluetooth {
    use super::UsbId;

    pub const INTEL_AX200: UsbId = UsbId::new(0x8087, 0x0029);
    pub const INTEL_AX201: UsbId = UsbId::new(0x8087, 0x0026);
    pub const INTEL_AC9560: UsbId = UsbId::new(0x8087, 0x0AAA);
    pub const BROADCOM_BCM20702: UsbId = UsbId::new(0x0A5C, 0x21E8);
    pub const REALTEK_RTL8761B: UsbId = UsbId::new(0x0BDA, 0x8771);

    pub const ALL: &[UsbId] = &[
        INTEL_AX200,
        INTEL_AX201,
        INTEL_AC9560,
        BROADCOM_BCM20702,
        REALTEK_RTL8761B,
    ];
}

/// Id substrings that mark platform-internal or virtual ports
pub const DENIED_ID_PATTERNS: &[&str] = &[
    // ACPI-enumerated UARTs on the mainboard
    "ACPI",
    // Bluetooth serial profile ports
    "BTHENUM",
    // macOS Bluetooth incoming port
    "Bluetooth-Incoming-Port",
    // Debug consoles
    "debug-console",
];

/// Denylist consulted before a candidate is created
#[derive(Debug, Clone)]
pub struct Denylist {
    patterns: Vec<String>,
    usb_ids: Vec<UsbId>,
}

impl Denylist {
    /// Built-in entries only
    pub fn new() -> Self {
        Self {
            patterns: DENIED_ID_PATTERNS.iter().map(|p| p.to_string()).collect(),
            usb_ids: bluetooth::ALL.to_vec(),
        }
    }

    /// Built-in entries plus extra id substrings
    pub fn with_extra_patterns<I, S>(extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut denylist = Self::new();
        denylist
            .patterns
            .extend(extra.into_iter().map(Into::into).filter(|p| !p.is_empty()));
        denylist
    }

    /// Check whether an endpoint must be discarded
    pub fn is_denied(&self, identity: &DeviceIdentity) -> bool {
        let id = identity.id().as_str();
        if self.patterns.iter().any(|p| id.contains(p.as_str())) {
            return true;
        }

        identity
            .usb_fields()
            .map(|u| self.usb_ids.contains(&UsbId::new(u.vid, u.pid)))
            .unwrap_or(false)
    }
}

impl Default for Denylist {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nano_protocol::Selector;

    fn identity(id: &str) -> DeviceIdentity {
        DeviceIdentity::new(id, "port", "/dev/port", Selector::new("any")).unwrap()
    }

    #[test]
    fn test_acpi_denied() {
        let denylist = Denylist::new();
        assert!(denylist.is_denied(&identity(r"ACPI\PNP0501\0")));
    }

    #[test]
    fn test_bluetooth_vid_pid_denied() {
        let denylist = Denylist::new();
        assert!(denylist.is_denied(&identity("USB#VID_8087&PID_0AAA#x#/dev/ttyACM3")));
    }

    #[test]
    fn test_regular_usb_allowed() {
        let denylist = Denylist::new();
        assert!(!denylist.is_denied(&identity("USB#VID_0483&PID_5740#NANO_1#/dev/ttyACM0")));
        assert!(!denylist.is_denied(&identity("PCI#/dev/ttyS0")));
    }

    #[test]
    fn test_extra_patterns() {
        let denylist = Denylist::with_extra_patterns(["ttyS", ""]);
        assert!(denylist.is_denied(&identity("PCI#/dev/ttyS0")));
        assert!(!denylist.is_denied(&identity("USB#VID_0483&PID_5740#x#/dev/ttyACM0")));
    }
}
