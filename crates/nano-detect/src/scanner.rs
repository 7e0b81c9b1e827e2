//! Serial port enumeration
//!
//! The watcher asks a `DeviceEnumerator` for the current set of endpoints that
//! match a selector. `SerialPortEnumerator` answers from the OS port list.

use nano_protocol::{DeviceIdentity, Selector, ID_DELIMITER};
use serialport::{available_ports, SerialPortType};
use tracing::{debug, trace};

use crate::error::DetectError;

/// Source of the endpoints currently present for a selector
pub trait DeviceEnumerator: Send + Sync {
    /// List every endpoint matching `selector`
    fn enumerate(&self, selector: &Selector) -> Result<Vec<DeviceIdentity>, DetectError>;
}

/// Port classes the serialport enumerator understands as selectors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortClass {
    Usb,
    Pci,
    Bluetooth,
    Any,
}

impl PortClass {
    /// Interpret a selector token; unknown tokens match nothing
    pub fn from_selector(selector: &Selector) -> Option<Self> {
        match selector.as_str().to_ascii_lowercase().as_str() {
            "usb" => Some(Self::Usb),
            "pci" => Some(Self::Pci),
            "bluetooth" => Some(Self::Bluetooth),
            "any" | "*" => Some(Self::Any),
            _ => None,
        }
    }

    fn matches(&self, port_type: &SerialPortType) -> bool {
        match self {
            Self::Any => true,
            Self::Usb => matches!(port_type, SerialPortType::UsbPort(_)),
            Self::Pci => matches!(port_type, SerialPortType::PciPort),
            Self::Bluetooth => matches!(port_type, SerialPortType::BluetoothPort),
        }
    }
}

/// Enumerator backed by `serialport::available_ports`
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialPortEnumerator;

impl SerialPortEnumerator {
    pub fn new() -> Self {
        Self
    }
}

impl DeviceEnumerator for SerialPortEnumerator {
    fn enumerate(&self, selector: &Selector) -> Result<Vec<DeviceIdentity>, DetectError> {
        let Some(class) = PortClass::from_selector(selector) else {
            debug!("Selector {} matches no serial port class", selector);
            return Ok(Vec::new());
        };

        let ports = available_ports()?;
        trace!("OS reports {} serial port(s)", ports.len());

        ports
            .into_iter()
            .filter(|p| class.matches(&p.port_type))
            .map(|p| identity_from_port(&p.port_name, &p.port_type, selector))
            .collect()
    }
}

/// Build a platform device id and identity for an OS serial port
///
/// USB ports get `USB#VID_xxxx&PID_yyyy#<serial>#<port>` so the serial number
/// lands in its own delimited segment.
pub fn identity_from_port(
    port_name: &str,
    port_type: &SerialPortType,
    selector: &Selector,
) -> Result<DeviceIdentity, DetectError> {
    let (id, display_name) = match port_type {
        SerialPortType::UsbPort(usb) => {
            let serial = usb
                .serial_number
                .as_deref()
                .map(sanitize_segment)
                .unwrap_or_default();
            let id = format!(
                "USB{d}VID_{:04X}&PID_{:04X}{d}{}{d}{}",
                usb.vid,
                usb.pid,
                serial,
                port_name,
                d = ID_DELIMITER
            );
            let name = usb
                .product
                .clone()
                .unwrap_or_else(|| short_port_name(port_name).to_string());
            (id, name)
        }
        SerialPortType::PciPort => (
            format!("PCI{}{}", ID_DELIMITER, port_name),
            short_port_name(port_name).to_string(),
        ),
        SerialPortType::BluetoothPort => (
            format!("BTHENUM{}{}", ID_DELIMITER, port_name),
            short_port_name(port_name).to_string(),
        ),
        SerialPortType::Unknown => (
            format!("SERIAL{}{}", ID_DELIMITER, port_name),
            short_port_name(port_name).to_string(),
        ),
    };

    Ok(DeviceIdentity::new(id, display_name, port_name, selector.clone())?)
}

fn sanitize_segment(raw: &str) -> String {
    raw.trim().replace(ID_DELIMITER, "_")
}

fn short_port_name(port_name: &str) -> &str {
    port_name.rsplit('/').next().unwrap_or(port_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serialport::UsbPortInfo;

    fn usb(serial: Option<&str>) -> SerialPortType {
        SerialPortType::UsbPort(UsbPortInfo {
            vid: 0x2E8A,
            pid: 0x000A,
            serial_number: serial.map(str::to_string),
            manufacturer: Some("Raspberry Pi".to_string()),
            product: Some("Pico".to_string()),
        })
    }

    #[test]
    fn test_usb_identity_carries_marker_segment() {
        let identity =
            identity_from_port("/dev/ttyACM0", &usb(Some("NANO_ABC123")), &Selector::new("usb"))
                .unwrap();

        assert_eq!(
            identity.id().as_str(),
            "USB#VID_2E8A&PID_000A#NANO_ABC123#/dev/ttyACM0"
        );
        assert_eq!(identity.display_name(), "Pico");
        assert_eq!(identity.target_marker(), Some("ABC123"));
        let fields = identity.usb_fields().unwrap();
        assert_eq!(fields.vid, 0x2E8A);
        assert_eq!(fields.serial.as_deref(), Some("NANO_ABC123"));
    }

    #[test]
    fn test_usb_identity_without_serial() {
        let identity =
            identity_from_port("/dev/ttyACM1", &usb(None), &Selector::new("usb")).unwrap();
        assert_eq!(identity.target_marker(), None);
        assert_eq!(identity.usb_fields().unwrap().serial, None);
    }

    #[test]
    fn test_serial_with_delimiter_is_sanitized() {
        let identity =
            identity_from_port("/dev/ttyACM2", &usb(Some("A#B")), &Selector::new("usb")).unwrap();
        assert!(identity.id().as_str().contains("#A_B#"));
    }

    #[test]
    fn test_pci_identity() {
        let identity =
            identity_from_port("/dev/ttyS0", &SerialPortType::PciPort, &Selector::new("pci"))
                .unwrap();
        assert_eq!(identity.id().as_str(), "PCI#/dev/ttyS0");
        assert_eq!(identity.display_name(), "ttyS0");
        assert_eq!(identity.usb_fields(), None);
    }

    #[test]
    fn test_selector_classes() {
        assert_eq!(PortClass::from_selector(&Selector::new("USB")), Some(PortClass::Usb));
        assert_eq!(PortClass::from_selector(&Selector::new("*")), Some(PortClass::Any));
        assert_eq!(PortClass::from_selector(&Selector::new("hid")), None);
        assert!(PortClass::Usb.matches(&usb(None)));
        assert!(!PortClass::Pci.matches(&usb(None)));
    }
}
