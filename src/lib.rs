//! # JoyLink Library
//!
//! Stream joystick positions to a Bluetooth serial device.
//!
//! This library provides device discovery, a single exclusive serial link
//! with newline-delimited messaging, and the UI-facing state that combines
//! both.

pub mod config;
pub mod device;
pub mod discovery;
pub mod error;
pub mod joystick;
pub mod link;
pub mod logging;
pub mod platform;
pub mod ui_state;

#[cfg(test)]
mod test_support;
