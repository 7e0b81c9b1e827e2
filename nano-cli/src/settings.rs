//! Application settings

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use nano_link::DiscoveryConfig;
use nano_sim::VirtualPortConfig;
use serde::{Deserialize, Serialize};

/// Settings file contents
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Settings {
    /// Discovery service configuration
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    /// Virtual ports plugged when running with `--simulate`
    #[serde(default)]
    pub simulated_ports: Vec<VirtualPortConfig>,
}

impl Settings {
    /// Get the XDG config directory for nanolink
    /// Uses $XDG_CONFIG_HOME/nanolink on Linux/macOS, falls back to ~/.config/nanolink
    fn config_dir() -> Option<PathBuf> {
        if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
            let path = PathBuf::from(xdg_config);
            if path.is_absolute() {
                return Some(path.join("nanolink"));
            }
        }

        dirs::home_dir().map(|h| h.join(".config").join("nanolink"))
    }

    /// Default settings file path
    pub fn default_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("settings.json"))
    }

    /// Load settings from the default location, falling back to defaults
    pub fn load() -> Self {
        Self::default_path()
            .and_then(|path| std::fs::read_to_string(path).ok())
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default()
    }

    /// Load settings from an explicit path; a missing or malformed file is an error
    pub fn load_from(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings from {}", path.display()))?;
        serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse settings in {}", path.display()))
    }

    /// Save settings to `path`, or the default location when `None`
    pub fn save(&self, path: Option<&Path>) -> Result<PathBuf> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_path().context("Could not determine settings path")?,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create settings directory")?;
        }

        let json = serde_json::to_string_pretty(self).context("Failed to serialize settings")?;
        std::fs::write(&path, json).context("Failed to write settings")?;

        Ok(path)
    }

    /// Ports plugged on the virtual bus when none are configured
    pub fn demo_ports() -> Vec<VirtualPortConfig> {
        use nano_sim::TargetBehavior;
        vec![
            VirtualPortConfig::nano_usb("/dev/ttyACM0", "SIM001"),
            VirtualPortConfig::plain("/dev/ttyUSB0", TargetBehavior::ShortReply(20)),
            VirtualPortConfig::plain("/dev/ttyUSB1", TargetBehavior::Responsive),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let settings: Settings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.discovery.poll_interval_ms, 500);
    }

    #[test]
    fn test_save_and_load_from_path() {
        let dir = std::env::temp_dir().join(format!("nanolink-settings-{}", std::process::id()));
        let path = dir.join("settings.json");

        let mut settings = Settings::default();
        settings.discovery.auto_reconnect = false;
        settings.simulated_ports = Settings::demo_ports();

        let written = settings.save(Some(&path)).unwrap();
        assert_eq!(written, path);
        assert_eq!(Settings::load_from(&path).unwrap(), settings);

        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_load_from_missing_file_fails() {
        let path = std::env::temp_dir().join("nanolink-does-not-exist.json");
        assert!(Settings::load_from(&path).is_err());
    }

    #[test]
    fn test_simulated_port_json() {
        let json = r#"{
            "simulated_ports": [
                { "id": "SERIAL#/dev/ttyUSB3", "name": "ttyUSB3", "port": "/dev/ttyUSB3",
                  "behavior": { "short_reply": 12 } }
            ]
        }"#;
        let settings: Settings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.simulated_ports.len(), 1);
        assert_eq!(settings.simulated_ports[0].selector.as_str(), "usb");
    }
}
