//! # Discovery Module
//!
//! Finding nearby and paired devices.
//!
//! This module handles:
//! - Platform scan start/stop with guaranteed release
//! - Forwarding found-device events into the registry
//! - Paired/discovered device sets with a live view for observers

pub mod registry;
pub mod scanner;

pub use registry::{DeviceRegistry, RegistryWatch};
pub use scanner::DiscoveryScanner;
