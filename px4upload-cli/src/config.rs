//! Configuration file support for px4upload.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (PX4UPLOAD_*)
//! 3. Local config file (./px4upload.toml)
//! 4. Global config file (~/.config/px4upload/config.toml)

use directories::ProjectDirs;
use log::{debug, warn};
use px4upload::{PortFilter, UploadOptions};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the local configuration file.
pub const LOCAL_CONFIG_FILE: &str = "px4upload.toml";

/// Connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Baud rate used to open the bootloader port.
    pub baud: Option<u32>,
    /// Name fragment a new port must contain to count as the bootloader.
    pub port_pattern: Option<String>,
}

/// Upload configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Attempts to open the detected port.
    pub open_attempts: Option<u32>,
    /// Seconds to wait for the erase to finish.
    pub erase_timeout_secs: Option<u64>,
    /// Seconds to wait for a bootloader to appear.
    pub detect_timeout_secs: Option<u64>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Connection configuration.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Upload configuration.
    #[serde(default)]
    pub upload: UploadConfig,
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
        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG_FILE)) {
            debug!("Loaded local config from {LOCAL_CONFIG_FILE}");
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
                    warn!("Failed to parse config file {}: TOML {}", path.display(), e);
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
        ProjectDirs::from("", "", "px4upload").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one.
    fn merge(&mut self, other: Self) {
        if other.connection.baud.is_some() {
            self.connection.baud = other.connection.baud;
        }
        if other.connection.port_pattern.is_some() {
            self.connection.port_pattern = other.connection.port_pattern;
        }

        if other.upload.open_attempts.is_some() {
            self.upload.open_attempts = other.upload.open_attempts;
        }
        if other.upload.erase_timeout_secs.is_some() {
            self.upload.erase_timeout_secs = other.upload.erase_timeout_secs;
        }
        if other.upload.detect_timeout_secs.is_some() {
            self.upload.detect_timeout_secs = other.upload.detect_timeout_secs;
        }
    }

    /// Apply the file settings on top of library defaults.
    pub fn upload_options(&self) -> UploadOptions {
        let mut options = UploadOptions::default();

        if let Some(baud) = self.connection.baud {
            options.serial.baud_rate = baud;
        }
        if let Some(ref pattern) = self.connection.port_pattern {
            options.port_filter = if pattern.is_empty() {
                PortFilter::any()
            } else {
                PortFilter::containing(pattern.clone())
            };
        }
        if let Some(attempts) = self.upload.open_attempts {
            options.open_attempts = attempts;
        }
        if let Some(secs) = self.upload.erase_timeout_secs {
            options.erase_timeout_ticks = erase_ticks_for(Duration::from_secs(secs), options.erase_tick);
        }
        if let Some(secs) = self.upload.detect_timeout_secs {
            options.detect_timeout = Some(Duration::from_secs(secs));
        }

        options
    }
}

/// Number of erase checks covering `timeout` at one check per `tick`.
pub fn erase_ticks_for(timeout: Duration, tick: Duration) -> u32 {
    if tick.is_zero() {
        return 1;
    }
    let ticks = timeout.as_millis() / tick.as_millis().max(1);
    u32::try_from(ticks)
        .unwrap_or(u32::MAX)
        .max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    // ---- Default values ----

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.connection.baud.is_none());
        assert!(config.connection.port_pattern.is_none());
        assert!(config.upload.open_attempts.is_none());
        assert!(config.upload.erase_timeout_secs.is_none());
        assert!(config.upload.detect_timeout_secs.is_none());
    }

    #[test]
    fn test_default_config_gives_library_defaults() {
        let options = Config::default().upload_options();
        assert_eq!(options, UploadOptions::default());
    }

    // ---- Config merge ----

    #[test]
    fn test_config_merge_connection() {
        let mut base = Config::default();
        base.connection.baud = Some(115200);

        let mut other = Config::default();
        other.connection.baud = Some(57600);
        other.connection.port_pattern = Some("ttyUSB".to_string());

        base.merge(other);
        assert_eq!(base.connection.baud, Some(57600));
        assert_eq!(base.connection.port_pattern.as_deref(), Some("ttyUSB"));
    }

    #[test]
    fn test_config_merge_does_not_overwrite_with_none() {
        let mut base = Config::default();
        base.connection.baud = Some(115200);
        base.upload.open_attempts = Some(10);

        let other = Config::default(); // all None
        base.merge(other);

        assert_eq!(base.connection.baud, Some(115200));
        assert_eq!(base.upload.open_attempts, Some(10));
    }

    // ---- Conversion to library options ----

    #[test]
    fn test_upload_options_from_config() {
        let mut config = Config::default();
        config.connection.baud = Some(57600);
        config.connection.port_pattern = Some("ttyUSB".to_string());
        config.upload.open_attempts = Some(5);
        config.upload.erase_timeout_secs = Some(30);
        config.upload.detect_timeout_secs = Some(120);

        let options = config.upload_options();
        assert_eq!(options.serial.baud_rate, 57600);
        assert!(options.port_filter.matches("/dev/ttyUSB0"));
        assert!(!options.port_filter.matches("/dev/ttyACM0"));
        assert_eq!(options.open_attempts, 5);
        assert_eq!(options.erase_timeout_ticks, 120);
        assert_eq!(options.detect_timeout, Some(Duration::from_secs(120)));
    }

    #[test]
    fn test_empty_pattern_accepts_any_port() {
        let mut config = Config::default();
        config.connection.port_pattern = Some(String::new());
        assert_eq!(config.upload_options().port_filter, PortFilter::any());
    }

    #[test]
    fn test_erase_ticks_for() {
        let tick = Duration::from_millis(250);
        assert_eq!(erase_ticks_for(Duration::from_secs(60), tick), 240);
        assert_eq!(erase_ticks_for(Duration::ZERO, tick), 1);
        assert_eq!(erase_ticks_for(Duration::from_secs(1), Duration::ZERO), 1);
    }

    // ---- TOML serialization/deserialization ----

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
[connection]
baud = 57600
port_pattern = "ttyACM"

[upload]
open_attempts = 20
erase_timeout_secs = 90
detect_timeout_secs = 300
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.connection.baud, Some(57600));
        assert_eq!(config.connection.port_pattern.as_deref(), Some("ttyACM"));
        assert_eq!(config.upload.open_attempts, Some(20));
        assert_eq!(config.upload.erase_timeout_secs, Some(90));
        assert_eq!(config.upload.detect_timeout_secs, Some(300));
    }

    #[test]
    fn test_config_from_empty_toml() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.connection.baud.is_none());
        assert!(config.upload.open_attempts.is_none());
    }

    #[test]
    fn test_config_roundtrip_toml() {
        let mut config = Config::default();
        config.connection.baud = Some(460800);
        config.upload.detect_timeout_secs = Some(15);

        let serialized = toml::to_string_pretty(&config).unwrap();
        let deserialized: Config = toml::from_str(&serialized).unwrap();

        assert_eq!(deserialized.connection.baud, Some(460800));
        assert_eq!(deserialized.upload.detect_timeout_secs, Some(15));
    }

    // ---- load_from_path with tempfile ----

    #[test]
    fn test_load_from_path_valid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test_config.toml");
        fs::write(
            &path,
            r#"
[connection]
port_pattern = "usbmodem"
[upload]
open_attempts = 3
"#,
        )
        .unwrap();

        let config = Config::load_from_path(&path);
        assert_eq!(config.connection.port_pattern.as_deref(), Some("usbmodem"));
        assert_eq!(config.upload.open_attempts, Some(3));
    }

    #[test]
    fn test_load_from_path_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "invalid toml [[[").unwrap();

        let config = Config::load_from_path(&path);
        assert!(config.connection.baud.is_none());
    }

    #[test]
    fn test_load_from_path_nonexistent() {
        let config = Config::load_from_path(Path::new("/nonexistent/path/config.toml"));
        // Should return default
        assert!(config.connection.baud.is_none());
    }

    // ---- global_config_path ----

    #[test]
    fn test_global_config_path_is_some() {
        // On most systems this should return Some
        let path = Config::global_config_path();
        if let Some(p) = path {
            assert!(p.to_str().unwrap().contains("px4upload"));
            assert!(p.to_str().unwrap().ends_with("config.toml"));
        }
    }
}
