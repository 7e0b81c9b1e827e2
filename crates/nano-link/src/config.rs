//! Discovery configuration

use std::time::Duration;

use nano_detect::Denylist;
use nano_protocol::Selector;
use serde::{Deserialize, Serialize};

/// Discovery service configuration
///
/// Line settings are deliberately absent; every target is opened with
/// `LineSettings::debug_target()`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscoveryConfig {
    /// One watcher is started per selector
    #[serde(default = "default_selectors")]
    pub selectors: Vec<Selector>,
    /// How often watchers re-enumerate (ms)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Reopen the last connected device when it shows up again
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
    /// Extra id substrings to never treat as targets
    #[serde(default)]
    pub extra_denylist: Vec<String>,
    /// Capacity of the event and command channels
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_selectors() -> Vec<Selector> {
    vec![Selector::new("usb")]
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_true() -> bool {
    true
}

fn default_channel_capacity() -> usize {
    256
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            selectors: default_selectors(),
            poll_interval_ms: default_poll_interval_ms(),
            auto_reconnect: true,
            extra_denylist: Vec::new(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl DiscoveryConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Built-in denylist plus the configured extra patterns
    pub fn denylist(&self) -> Denylist {
        Denylist::with_extra_patterns(self.extra_denylist.iter().cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_fields_use_defaults() {
        let config: DiscoveryConfig =
            serde_json::from_str(r#"{"selectors": ["usb", "pci"], "auto_reconnect": false}"#)
                .unwrap();
        assert_eq!(config.selectors, vec![Selector::new("usb"), Selector::new("pci")]);
        assert!(!config.auto_reconnect);
        assert_eq!(config.poll_interval(), Duration::from_millis(500));
        assert_eq!(config.channel_capacity, 256);
    }

    #[test]
    fn test_empty_object_is_default() {
        let config: DiscoveryConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, DiscoveryConfig::default());
    }

    #[test]
    fn test_zero_poll_interval_is_clamped() {
        let config = DiscoveryConfig {
            poll_interval_ms: 0,
            ..Default::default()
        };
        assert_eq!(config.poll_interval(), Duration::from_millis(1));
    }
}
