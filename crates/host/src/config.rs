//! Host configuration management

use crate::usb::UsbTarget;
use anyhow::{Context, Result, anyhow};
use evdevil::event::Key;
use protocol::WireFormat;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Longest wait `poll(2)` accepts through a 16-bit timeout
pub const MAX_CONNECT_TIMEOUT_MS: u64 = u16::MAX as u64;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(default)]
    pub host: HostSettings,
    #[serde(default)]
    pub usb: UsbSettings,
    #[serde(default)]
    pub input: InputSettings,
    /// Packet layout shared with the emulator firmware
    #[serde(default)]
    pub wire: WireFormat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostSettings {
    #[serde(default = "HostSettings::default_log_level")]
    pub log_level: String,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}

impl HostSettings {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsbSettings {
    /// Target device as "0xVID:0xPID"
    #[serde(default = "UsbSettings::default_device")]
    pub device: String,
    /// Root of the usbdevfs node tree
    #[serde(default = "UsbSettings::default_devfs_root")]
    pub devfs_root: PathBuf,
    /// Delay between bus scans while the device is absent
    #[serde(default = "UsbSettings::default_poll_interval")]
    pub poll_interval_ms: u64,
    /// First wait after connecting, so boot-time debug output is seen
    #[serde(default = "UsbSettings::default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Pause after a transfer error that signals a disconnect
    #[serde(default = "UsbSettings::default_disconnect_grace")]
    pub disconnect_grace_ms: u64,
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            device: Self::default_device(),
            devfs_root: Self::default_devfs_root(),
            poll_interval_ms: Self::default_poll_interval(),
            connect_timeout_ms: Self::default_connect_timeout(),
            disconnect_grace_ms: Self::default_disconnect_grace(),
        }
    }
}

impl UsbSettings {
    fn default_device() -> String {
        "0x16c0:0x0486".to_string()
    }

    fn default_devfs_root() -> PathBuf {
        PathBuf::from("/dev/bus/usb")
    }

    fn default_poll_interval() -> u64 {
        250
    }

    fn default_connect_timeout() -> u64 {
        1000
    }

    fn default_disconnect_grace() -> u64 {
        250
    }

    /// Parse the configured device identifier
    pub fn target(&self) -> Result<UsbTarget> {
        let (vid, pid) = self.device.split_once(':').ok_or_else(|| {
            anyhow!(
                "Invalid device '{}', expected VID:PID (e.g., '0x16c0:0x0486')",
                self.device
            )
        })?;

        Ok(UsbTarget {
            vendor_id: parse_hex_id(vid, "VID")?,
            product_id: parse_hex_id(pid, "PID")?,
        })
    }

    /// usbdevfs root with `~` and environment variables expanded
    pub fn devfs_root(&self) -> Result<PathBuf> {
        expand_path(&self.devfs_root)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputSettings {
    /// Input devices beyond this count are ignored
    #[serde(default = "InputSettings::default_max_devices")]
    pub max_devices: usize,
    #[serde(default)]
    pub keymap: KeyBindings,
}

impl Default for InputSettings {
    fn default() -> Self {
        Self {
            max_devices: Self::default_max_devices(),
            keymap: KeyBindings::default(),
        }
    }
}

impl InputSettings {
    fn default_max_devices() -> usize {
        16
    }
}

/// evdev key code bound to each controller button
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyBindings {
    pub up: u16,
    pub down: u16,
    pub left: u16,
    pub right: u16,
    pub a: u16,
    pub b: u16,
    pub c: u16,
    pub start: u16,
}

impl Default for KeyBindings {
    fn default() -> Self {
        Self {
            up: Key::KEY_UP.raw(),
            down: Key::KEY_DOWN.raw(),
            left: Key::KEY_LEFT.raw(),
            right: Key::KEY_RIGHT.raw(),
            a: Key::KEY_HOME.raw(),
            b: Key::KEY_PAGEDOWN.raw(),
            c: Key::KEY_END.raw(),
            start: Key::KEY_LEFTALT.raw(),
        }
    }
}

impl KeyBindings {
    pub fn codes(&self) -> [u16; 8] {
        [
            self.up, self.down, self.left, self.right, self.a, self.b, self.c, self.start,
        ]
    }
}

impl HostConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            expand_path(&p)?
        } else {
            let candidates = vec![Self::default_path(), PathBuf::from("/etc/tas-host/host.toml")];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: HostConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::debug!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("tas-host").join("host.toml")
        } else {
            PathBuf::from(".config/tas-host/host.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.host.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.host.log_level,
                valid_levels.join(", ")
            ));
        }

        self.usb.target()?;

        if self.usb.poll_interval_ms == 0 {
            return Err(anyhow!("poll_interval_ms must be greater than zero"));
        }

        if self.usb.connect_timeout_ms > MAX_CONNECT_TIMEOUT_MS {
            return Err(anyhow!(
                "connect_timeout_ms must be at most {}",
                MAX_CONNECT_TIMEOUT_MS
            ));
        }

        let mut seen = HashSet::new();
        for code in self.input.keymap.codes() {
            if !seen.insert(code) {
                return Err(anyhow!("Key code {} is bound to more than one button", code));
            }
        }

        self.wire
            .validate()
            .map_err(|e| anyhow!("Invalid [wire] section: {}", e))?;

        Ok(())
    }
}

/// Parse a hex ID (VID or PID) written as "0x1234"
fn parse_hex_id(id: &str, name: &str) -> Result<u16> {
    let hex_part = id
        .strip_prefix("0x")
        .or_else(|| id.strip_prefix("0X"))
        .ok_or_else(|| anyhow!("Invalid {} '{}', must start with '0x' (e.g., '0x1234')", name, id))?;

    if hex_part.is_empty() || hex_part.len() > 4 {
        return Err(anyhow!(
            "Invalid {} '{}', hex part must be 1-4 digits",
            name,
            id
        ));
    }

    u16::from_str_radix(hex_part, 16)
        .map_err(|_| anyhow!("Invalid {} '{}', not a valid hex number", name, id))
}

/// Expand `~` and environment variables in a path
pub fn expand_path(path: &Path) -> Result<PathBuf> {
    let raw = path.to_string_lossy();
    let expanded = shellexpand::full(&raw)
        .with_context(|| format!("Failed to expand path: {}", raw))?;
    Ok(PathBuf::from(expanded.into_owned()))
}
