//! Configuration file support for fpgaboot.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (FPGABOOT_*)
//! 3. Local config file (./fpgaboot.toml)
//! 4. Global config file (~/.config/fpgaboot/config.toml)
//!
//! `--config PATH` replaces the file lookup of 3 and 4.

use directories::ProjectDirs;
use fpgaboot::FlasherConfig;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the local configuration file.
const LOCAL_CONFIG: &str = "fpgaboot.toml";

/// Connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Preferred serial port (e.g., "/dev/ttyUSB0" or "COM3").
    pub serial: Option<String>,
    /// Default baud rate.
    pub baud: Option<u32>,
}

/// Update defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateConfig {
    /// Application base address.
    pub address: Option<u32>,
    /// Version written into the descriptors (e.g. "1.2.3").
    pub version: Option<String>,
}

/// Timing overrides, in milliseconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Ack wait for ordinary requests.
    pub ack_timeout_ms: Option<u64>,
    /// Ack wait per erased sector.
    pub erase_timeout_ms: Option<u64>,
    /// Pause after each erase ack.
    pub erase_settle_ms: Option<u64>,
    /// Silence that ends a READ.
    pub read_idle_ms: Option<u64>,
    /// Silence that ends a text reply.
    pub reply_idle_ms: Option<u64>,
    /// Silence that ends a CHECK reply.
    pub check_idle_ms: Option<u64>,
    /// SAVE_BRICK attempts.
    pub brick_attempts: Option<u32>,
    /// Wait per SAVE_BRICK attempt.
    pub brick_interval_ms: Option<u64>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Update defaults.
    #[serde(default)]
    pub update: UpdateConfig,
    /// Timing overrides.
    #[serde(default)]
    pub timing: TimingConfig,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        // Load global config
        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Load local config (overrides global)
        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG)) {
            debug!("Loaded local config from {LOCAL_CONFIG}");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "fpgaboot").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one.
    fn merge(&mut self, other: Self) {
        fn take<T>(slot: &mut Option<T>, value: Option<T>) {
            if value.is_some() {
                *slot = value;
            }
        }

        take(&mut self.connection.serial, other.connection.serial);
        take(&mut self.connection.baud, other.connection.baud);

        take(&mut self.update.address, other.update.address);
        take(&mut self.update.version, other.update.version);

        let timing = other.timing;
        take(&mut self.timing.ack_timeout_ms, timing.ack_timeout_ms);
        take(&mut self.timing.erase_timeout_ms, timing.erase_timeout_ms);
        take(&mut self.timing.erase_settle_ms, timing.erase_settle_ms);
        take(&mut self.timing.read_idle_ms, timing.read_idle_ms);
        take(&mut self.timing.reply_idle_ms, timing.reply_idle_ms);
        take(&mut self.timing.check_idle_ms, timing.check_idle_ms);
        take(&mut self.timing.brick_attempts, timing.brick_attempts);
        take(&mut self.timing.brick_interval_ms, timing.brick_interval_ms);
    }

    /// Library timing with the configured overrides applied.
    pub fn flasher_config(&self) -> FlasherConfig {
        let t = &self.timing;
        let ms = Duration::from_millis;
        let mut config = FlasherConfig::default();

        if let Some(v) = t.ack_timeout_ms {
            config = config.with_ack_timeout(ms(v));
        }
        if let Some(v) = t.erase_timeout_ms {
            config = config.with_erase_timeout(ms(v));
        }
        if let Some(v) = t.erase_settle_ms {
            config = config.with_erase_settle(ms(v));
        }
        if let Some(v) = t.read_idle_ms {
            config = config.with_read_idle(ms(v));
        }
        if let Some(v) = t.reply_idle_ms {
            config = config.with_reply_idle(ms(v));
        }
        if let Some(v) = t.check_idle_ms {
            config = config.with_check_idle(ms(v));
        }
        if t.brick_attempts.is_some() || t.brick_interval_ms.is_some() {
            let attempts = t.brick_attempts.unwrap_or(config.brick_attempts);
            let interval = t.brick_interval_ms.map_or(config.brick_interval, ms);
            config = config.with_brick_retry(attempts, interval);
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.connection.serial.is_none());
        assert!(config.connection.baud.is_none());
        assert!(config.update.address.is_none());
        assert!(config.update.version.is_none());
        assert!(config.timing.ack_timeout_ms.is_none());
    }

    // ---- Config merge ----

    #[test]
    fn test_config_merge_overrides() {
        let mut base = Config::default();
        base.connection.baud = Some(115200);

        let mut other = Config::default();
        other.connection.serial = Some("/dev/ttyUSB0".to_string());
        other.connection.baud = Some(921600);
        other.update.version = Some("1.2.3".to_string());

        base.merge(other);

        assert_eq!(base.connection.serial.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(base.connection.baud, Some(921600));
        assert_eq!(base.update.version.as_deref(), Some("1.2.3"));
    }

    #[test]
    fn test_config_merge_does_not_overwrite_with_none() {
        let mut base = Config::default();
        base.connection.serial = Some("/dev/ttyUSB0".to_string());
        base.update.address = Some(0x0040_0000);
        base.timing.erase_timeout_ms = Some(5000);

        base.merge(Config::default());

        assert_eq!(base.connection.serial.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(base.update.address, Some(0x0040_0000));
        assert_eq!(base.timing.erase_timeout_ms, Some(5000));
    }

    // ---- TOML ----

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
[connection]
serial = "/dev/ttyUSB0"
baud = 115200

[update]
address = 0x00400000
version = "2.0.1"

[timing]
erase_timeout_ms = 5000
brick_attempts = 20
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.connection.serial.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(config.connection.baud, Some(115200));
        assert_eq!(config.update.address, Some(0x0040_0000));
        assert_eq!(config.update.version.as_deref(), Some("2.0.1"));
        assert_eq!(config.timing.erase_timeout_ms, Some(5000));
        assert_eq!(config.timing.brick_attempts, Some(20));
    }

    #[test]
    fn test_config_from_empty_toml() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.connection.serial.is_none());
        assert!(config.timing.brick_attempts.is_none());
    }

    #[test]
    fn test_flasher_config_applies_overrides() {
        let mut config = Config::default();
        config.timing.erase_timeout_ms = Some(5000);
        config.timing.brick_attempts = Some(4);

        let flasher = config.flasher_config();
        let defaults = FlasherConfig::default();
        assert_eq!(flasher.erase_timeout, Duration::from_secs(5));
        assert_eq!(flasher.brick_attempts, 4);
        assert_eq!(flasher.brick_interval, defaults.brick_interval);
        assert_eq!(flasher.ack_timeout, defaults.ack_timeout);
    }

    // ---- load_from_path ----

    #[test]
    fn test_load_from_path_valid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fpgaboot.toml");
        fs::write(
            &path,
            r#"
[connection]
serial = "/dev/ttyUSB1"
[timing]
check_idle_ms = 2000
"#,
        )
        .unwrap();

        let config = Config::load_from_path(&path);
        assert_eq!(config.connection.serial.as_deref(), Some("/dev/ttyUSB1"));
        assert_eq!(
            config.flasher_config().check_idle,
            Duration::from_secs(2)
        );
    }

    #[test]
    fn test_load_from_path_invalid_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "[connection\nserial = ").unwrap();

        let config = Config::load_from_path(&path);
        assert!(config.connection.serial.is_none());
    }

    #[test]
    fn test_load_from_path_nonexistent() {
        let config = Config::load_from_path(Path::new("/nonexistent/path/config.toml"));
        assert!(config.connection.serial.is_none());
    }

    #[test]
    fn test_global_config_path() {
        if let Some(p) = Config::global_config_path() {
            assert!(p.to_str().unwrap().contains("fpgaboot"));
            assert!(p.to_str().unwrap().ends_with("config.toml"));
        }
    }
}
