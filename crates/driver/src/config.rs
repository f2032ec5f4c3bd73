//! Driver configuration management
//!
//! Receiver identifiers and protocol timings are configuration data rather
//! than compiled-in constants, so the engine can be pointed at a simulated
//! receiver or a differently enumerated dongle.
//!
//! # Example Configuration
//! ```toml
//! [logging]
//! level = "debug"
//!
//! [receiver]
//! vendor_id = 0x046d
//! product_id = 0xc52b
//! interface = 2
//!
//! [timing]
//! long_press_ms = 300
//! ```

use anyhow::{Context, Result, anyhow};
use common::InterfaceSelector;
use protocol::FirmwareVersion;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub receiver: ReceiverSettings,
    #[serde(default)]
    pub timing: TimingSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Default level when `RUST_LOG` is not set
    #[serde(default = "LoggingSettings::default_level")]
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
        }
    }
}

impl LoggingSettings {
    fn default_level() -> String {
        "info".to_string()
    }
}

/// Which USB device and interface to drive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiverSettings {
    #[serde(default = "ReceiverSettings::default_vendor_id")]
    pub vendor_id: u16,
    #[serde(default = "ReceiverSettings::default_product_id")]
    pub product_id: u16,
    #[serde(default)]
    pub config_index: u8,
    /// Interface carrying the DJ reports
    #[serde(default = "ReceiverSettings::default_interface")]
    pub interface: u8,
    #[serde(default)]
    pub alt_setting: u8,
    #[serde(default)]
    pub endpoint_index: usize,
}

impl Default for ReceiverSettings {
    fn default() -> Self {
        Self {
            vendor_id: Self::default_vendor_id(),
            product_id: Self::default_product_id(),
            config_index: 0,
            interface: Self::default_interface(),
            alt_setting: 0,
            endpoint_index: 0,
        }
    }
}

impl ReceiverSettings {
    fn default_vendor_id() -> u16 {
        0x046d // Logitech
    }

    fn default_product_id() -> u16 {
        0xc52b // Unifying receiver
    }

    fn default_interface() -> u8 {
        2
    }

    pub fn selector(&self) -> InterfaceSelector {
        InterfaceSelector {
            config_index: self.config_index,
            interface: self.interface,
            alt_setting: self.alt_setting,
            endpoint_index: self.endpoint_index,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingSettings {
    /// Read timeout while no key is held
    #[serde(default = "TimingSettings::default_idle_timeout")]
    pub idle_timeout_ms: u64,
    /// How long a key must stay down to count as a long press
    #[serde(default = "TimingSettings::default_long_press")]
    pub long_press_ms: u64,
    /// Unanswered requests are dropped after this long
    #[serde(default = "TimingSettings::default_request_timeout")]
    pub request_timeout_ms: u64,
    #[serde(default = "TimingSettings::default_firmware_retries")]
    pub firmware_retries: u32,
    #[serde(default = "TimingSettings::default_firmware_retry_delay")]
    pub firmware_retry_delay_ms: u64,
    /// Receivers newer than this may swallow media and directional keys
    #[serde(default = "TimingSettings::default_newest_supported_firmware")]
    pub newest_supported_firmware: u32,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            idle_timeout_ms: Self::default_idle_timeout(),
            long_press_ms: Self::default_long_press(),
            request_timeout_ms: Self::default_request_timeout(),
            firmware_retries: Self::default_firmware_retries(),
            firmware_retry_delay_ms: Self::default_firmware_retry_delay(),
            newest_supported_firmware: Self::default_newest_supported_firmware(),
        }
    }
}

impl TimingSettings {
    fn default_idle_timeout() -> u64 {
        10_000
    }

    fn default_long_press() -> u64 {
        250
    }

    fn default_request_timeout() -> u64 {
        2_000
    }

    fn default_firmware_retries() -> u32 {
        10
    }

    fn default_firmware_retry_delay() -> u64 {
        1_000
    }

    fn default_newest_supported_firmware() -> u32 {
        FirmwareVersion::NEWEST_FULLY_SUPPORTED.0
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn long_press(&self) -> Duration {
        Duration::from_millis(self.long_press_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn firmware_retry_delay(&self) -> Duration {
        Duration::from_millis(self.firmware_retry_delay_ms)
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// Without an explicit path the user and system locations are tried in
    /// order.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/harmony-remote/config.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration, falling back to defaults on any error
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

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

    /// `~/.config/harmony-remote/config.toml`
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("harmony-remote").join("config.toml")
        } else {
            PathBuf::from(".config/harmony-remote/config.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            ));
        }

        let timing = &self.timing;
        for (name, value) in [
            ("idle_timeout_ms", timing.idle_timeout_ms),
            ("long_press_ms", timing.long_press_ms),
            ("request_timeout_ms", timing.request_timeout_ms),
        ] {
            if value == 0 {
                return Err(anyhow!("Invalid {}: must be greater than zero", name));
            }
        }

        // The read timeout doubles as the long-press clock
        if timing.long_press_ms >= timing.idle_timeout_ms {
            return Err(anyhow!(
                "Invalid long_press_ms {}: must be below idle_timeout_ms {}",
                timing.long_press_ms,
                timing.idle_timeout_ms
            ));
        }

        if self.receiver.vendor_id == 0 {
            return Err(anyhow!("Invalid vendor_id: must not be zero"));
        }

        Ok(())
    }
}

/// Load configuration from a path that may start with `~`
pub fn load_config(path: &str) -> Result<Config> {
    let path_buf = PathBuf::from(shellexpand::tilde(path).as_ref());
    Config::load(Some(path_buf))
}
