//! Serial line settings for debug targets

use std::time::Duration;

/// Number of data bits per character
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DataBits {
    Seven,
    Eight,
}

/// Parity checking mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Parity {
    None,
    Odd,
    Even,
}

/// Number of stop bits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum StopBits {
    One,
    Two,
}

/// Flow control mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FlowControl {
    None,
    Software,
    Hardware,
}

/// Line parameters applied when a transport is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LineSettings {
    /// Baud rate
    pub baud_rate: u32,
    /// Data bits
    pub data_bits: DataBits,
    /// Parity
    pub parity: Parity,
    /// Stop bits
    pub stop_bits: StopBits,
    /// Flow control
    pub flow_control: FlowControl,
    /// Upper bound for a single write
    pub write_timeout: Duration,
    /// Upper bound for a single read
    pub read_timeout: Duration,
}

impl LineSettings {
    /// Settings every debug target is opened with
    ///
    /// Parity is always `None`, whatever the device reports as its default;
    /// the target firmware does not answer on a parity-checked line.
    pub const fn debug_target() -> Self {
        Self {
            baud_rate: 115_200,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
            write_timeout: Duration::from_secs(1),
            read_timeout: Duration::from_secs(2),
        }
    }
}

impl Default for LineSettings {
    fn default() -> Self {
        Self::debug_target()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_target_settings() {
        let settings = LineSettings::debug_target();
        assert_eq!(settings.baud_rate, 115_200);
        assert_eq!(settings.data_bits, DataBits::Eight);
        assert_eq!(settings.parity, Parity::None);
        assert_eq!(settings.write_timeout, Duration::from_secs(1));
        assert_eq!(settings.read_timeout, Duration::from_secs(2));
    }
}
