//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.
//!
//! Every section and every field is optional; missing values fall back to
//! the `default_*` functions below.

use serde::de::Error;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{JoyLinkError, Result};

/// Baud rates accepted for the serial link
pub const SUPPORTED_BAUD_RATES: &[u32] = &[
    1200, 2400, 4800, 9600, 19200, 38400, 57600, 115200, 230400, 460800, 921600,
];

/// Log levels accepted in `[logging] level`
const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub link: LinkConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub joystick: JoystickConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Serial link configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LinkConfig {
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_send_queue_capacity")]
    pub send_queue_capacity: usize,

    /// Address of the device to connect to. Empty means "first known device".
    #[serde(default)]
    pub device: String,
}

/// Discovery configuration
#[derive(Debug, Deserialize, Clone)]
pub struct DiscoveryConfig {
    #[serde(default = "default_port_patterns")]
    pub port_patterns: Vec<String>,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_scan_duration_s")]
    pub scan_duration_s: u64,
}

/// Joystick output configuration
#[derive(Debug, Deserialize, Clone)]
pub struct JoystickConfig {
    #[serde(default = "default_send_rate_hz")]
    pub send_rate_hz: u32,

    #[serde(default = "default_max_deflection")]
    pub max_deflection: i32,
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub file_enabled: bool,

    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    #[serde(default = "default_file_prefix")]
    pub file_prefix: String,
}

// Default value functions
fn default_baud_rate() -> u32 { 9600 }
fn default_connect_timeout_ms() -> u64 { 10_000 }
fn default_send_queue_capacity() -> usize { 32 }

fn default_port_patterns() -> Vec<String> { vec!["rfcomm".to_string()] }
fn default_poll_interval_ms() -> u64 { 1000 }
fn default_scan_duration_s() -> u64 { 12 }

fn default_send_rate_hz() -> u32 { 50 }
fn default_max_deflection() -> i32 { 200 }

fn default_log_level() -> String { "info".to_string() }
fn default_log_dir() -> String { "./logs".to_string() }
fn default_file_prefix() -> String { "joylink.log".to_string() }

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            baud_rate: default_baud_rate(),
            connect_timeout_ms: default_connect_timeout_ms(),
            send_queue_capacity: default_send_queue_capacity(),
            device: String::new(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            port_patterns: default_port_patterns(),
            poll_interval_ms: default_poll_interval_ms(),
            scan_duration_s: default_scan_duration_s(),
        }
    }
}

impl Default for JoystickConfig {
    fn default() -> Self {
        Self {
            send_rate_hz: default_send_rate_hz(),
            max_deflection: default_max_deflection(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file_enabled: false,
            log_dir: default_log_dir(),
            file_prefix: default_file_prefix(),
        }
    }
}

impl LinkConfig {
    /// Handshake deadline for a single connection attempt
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Target device address, if one was configured
    pub fn target_device(&self) -> Option<&str> {
        let trimmed = self.device.trim();
        (!trimmed.is_empty()).then_some(trimmed)
    }
}

impl DiscoveryConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn scan_duration(&self) -> Duration {
        Duration::from_secs(self.scan_duration_s)
    }
}

impl JoystickConfig {
    /// Period between two joystick transmissions
    pub fn send_period(&self) -> Duration {
        Duration::from_micros(1_000_000 / u64::from(self.send_rate_hz.max(1)))
    }
}

fn invalid(message: impl std::fmt::Display) -> JoyLinkError {
    JoyLinkError::Config(toml::de::Error::custom(message))
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use joylink::config::Config;
    ///
    /// let config = Config::load("config/joylink.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse and validate configuration from TOML text
    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is out of valid range
    pub fn validate(&self) -> Result<()> {
        if !SUPPORTED_BAUD_RATES.contains(&self.link.baud_rate) {
            return Err(invalid(format!(
                "baud_rate {} is not a standard rate",
                self.link.baud_rate
            )));
        }

        if self.link.connect_timeout_ms == 0 || self.link.connect_timeout_ms > 60_000 {
            return Err(invalid("connect_timeout_ms must be between 1 and 60000"));
        }

        if self.link.send_queue_capacity == 0 || self.link.send_queue_capacity > 1024 {
            return Err(invalid("send_queue_capacity must be between 1 and 1024"));
        }

        if self.discovery.port_patterns.is_empty()
            || self.discovery.port_patterns.iter().any(|p| p.trim().is_empty())
        {
            return Err(invalid("port_patterns must contain at least one non-empty pattern"));
        }

        if self.discovery.poll_interval_ms < 10 || self.discovery.poll_interval_ms > 60_000 {
            return Err(invalid("poll_interval_ms must be between 10 and 60000"));
        }

        if self.discovery.scan_duration_s == 0 || self.discovery.scan_duration_s > 300 {
            return Err(invalid("scan_duration_s must be between 1 and 300"));
        }

        if self.joystick.send_rate_hz == 0 || self.joystick.send_rate_hz > 500 {
            return Err(invalid("send_rate_hz must be between 1 and 500"));
        }

        if self.joystick.max_deflection <= 0 || self.joystick.max_deflection > 10_000 {
            return Err(invalid("max_deflection must be between 1 and 10000"));
        }

        if !LOG_LEVELS.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(invalid(format!(
                "log level must be one of: {}",
                LOG_LEVELS.join(", ")
            )));
        }

        if self.logging.file_enabled
            && (self.logging.log_dir.is_empty() || self.logging.file_prefix.is_empty())
        {
            return Err(invalid(
                "log_dir and file_prefix cannot be empty when file logging is enabled",
            ));
        }

        Ok(())
    }
}
