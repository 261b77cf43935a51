//! Probe configuration management

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use usbtarget::TargetOptions;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProbeConfig {
    #[serde(default)]
    pub probe: ProbeSettings,
    #[serde(default)]
    pub usb: UsbSettings,
    /// Options for target creation
    #[serde(default)]
    pub target: TargetOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeSettings {
    #[serde(default = "ProbeSettings::default_log_level")]
    pub log_level: String,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}

impl ProbeSettings {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsbSettings {
    /// Device to open, as a VID:PID filter (e.g. "0x0781:0x5567" or "0x0781:*")
    ///
    /// When unset the first non-hub device is used.
    #[serde(default)]
    pub device: Option<String>,
    /// Timeout for each transfer the USB worker executes
    #[serde(default = "UsbSettings::default_transfer_timeout")]
    pub transfer_timeout_ms: u64,
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            device: None,
            transfer_timeout_ms: Self::default_transfer_timeout(),
        }
    }
}

impl UsbSettings {
    fn default_transfer_timeout() -> u64 {
        5000
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }
}

impl ProbeConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            expand_path(&p)
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usbtarget/probe.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: ProbeConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::debug!("Loaded configuration from: {}", config_path.display());
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
            config_dir.join("usbtarget").join("probe.toml")
        } else {
            PathBuf::from(".config/usbtarget/probe.toml")
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.probe.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.probe.log_level,
                valid_levels.join(", ")
            ));
        }

        if let Some(filter) = &self.usb.device {
            validate_filter(filter)?;
        }

        if self.usb.transfer_timeout_ms == 0 {
            return Err(anyhow!("transfer_timeout_ms must be greater than zero"));
        }

        Ok(())
    }
}

fn expand_path(path: &Path) -> PathBuf {
    match path.to_str() {
        Some(s) => PathBuf::from(shellexpand::tilde(s).as_ref()),
        None => path.to_path_buf(),
    }
}

/// Validate a USB device filter pattern (VID:PID)
pub fn validate_filter(filter: &str) -> Result<()> {
    let parts: Vec<&str> = filter.split(':').collect();
    if parts.len() != 2 {
        return Err(anyhow!(
            "Invalid filter format '{}', expected VID:PID (e.g., '0x1234:0x5678' or '0x1234:*')",
            filter
        ));
    }

    let (vid, pid) = (parts[0], parts[1]);

    if vid != "*" {
        validate_hex_id(vid, "VID")?;
    }

    if pid != "*" {
        validate_hex_id(pid, "PID")?;
    }

    Ok(())
}

/// Validate a hex ID (VID or PID)
fn validate_hex_id(id: &str, name: &str) -> Result<()> {
    if !id.starts_with("0x") && !id.starts_with("0X") {
        return Err(anyhow!(
            "Invalid {} '{}', must start with '0x' (e.g., '0x1234')",
            name,
            id
        ));
    }

    let hex_part = &id[2..];
    if hex_part.is_empty() || hex_part.len() > 4 {
        return Err(anyhow!(
            "Invalid {} '{}', hex part must be 1-4 digits",
            name,
            id
        ));
    }

    u16::from_str_radix(hex_part, 16)
        .map_err(|_| anyhow!("Invalid {} '{}', not a valid hex number", name, id))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = ProbeConfig::default();
        assert_eq!(config.probe.log_level, "info");
        assert!(config.usb.device.is_none());
        assert_eq!(config.usb.transfer_timeout(), Duration::from_secs(5));
        assert_eq!(config.target.client_contract_version, 0x602);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_filter_valid() {
        assert!(validate_filter("0x1234:0x5678").is_ok());
        assert!(validate_filter("0x1234:*").is_ok());
        assert!(validate_filter("*:0x5678").is_ok());
        assert!(validate_filter("*:*").is_ok());
        assert!(validate_filter("0xABCD:0xEF01").is_ok());
    }

    #[test]
    fn test_validate_filter_invalid() {
        assert!(validate_filter("1234:5678").is_err());
        assert!(validate_filter("0x1234").is_err());
        assert!(validate_filter("0x1234:0x5678:0x9abc").is_err());
        assert!(validate_filter("0xGHIJ:0x5678").is_err());
        assert!(validate_filter("0x12345:0x5678").is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = ProbeConfig::default();
        config.probe.log_level = "loud".to_string();
        assert!(config.validate().is_err());

        let mut config = ProbeConfig::default();
        config.usb.device = Some("0781:5567".to_string());
        assert!(config.validate().is_err());

        let mut config = ProbeConfig::default();
        config.usb.transfer_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("probe.toml");

        let mut config = ProbeConfig::default();
        config.usb.device = Some("0x0781:0x5567".to_string());
        config.target.quiesce_timeout_ms = 750;
        config.save(&path).unwrap();

        let loaded = ProbeConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.usb.device.as_deref(), Some("0x0781:0x5567"));
        assert_eq!(loaded.target.quiesce_timeout_ms, 750);
        assert_eq!(loaded.target.client_contract_version, 0x602);
    }

    #[test]
    fn test_load_fills_missing_sections() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("probe.toml");
        fs::write(&path, "[usb]\ndevice = \"0x046d:*\"\n").unwrap();

        let config = ProbeConfig::load(Some(path)).unwrap();
        assert_eq!(config.probe.log_level, "info");
        assert_eq!(config.usb.transfer_timeout_ms, 5000);
        assert_eq!(config.target, TargetOptions::default());
    }

    #[test]
    fn test_load_rejects_invalid_filter() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("probe.toml");
        fs::write(&path, "[usb]\ndevice = \"mouse\"\n").unwrap();

        assert!(ProbeConfig::load(Some(path)).is_err());
    }
}
