//! # Error Types
//!
//! Custom error types for JoyLink using `thiserror`.

use thiserror::Error;

/// Main error type for JoyLink
#[derive(Debug, Error)]
pub enum JoyLinkError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serial port errors (open, configure, enumerate)
    #[error("Serial port error: {0}")]
    Serial(String),

    /// Discovery could not be started
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// No device matched the requested address
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Connection handshake or transport failure
    #[error("Connection error: {0}")]
    Connection(String),

    /// Malformed joystick message
    #[error("Invalid joystick message: {0}")]
    InvalidMessage(String),
}

/// Result type alias for JoyLink
pub type Result<T> = std::result::Result<T, JoyLinkError>;
