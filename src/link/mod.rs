//! # Link Module
//!
//! Serial connection management and message transfer.
//!
//! This module handles:
//! - Opening a single exclusive serial channel to a remote device
//! - Reading newline-delimited messages without blocking the caller
//! - A bounded, serialized outbound send queue
//! - Translating transport faults into [`ConnectionResult`] events
//! - Cancellation and guaranteed channel teardown

pub mod controller;
pub mod serial_link;

use serde::Serialize;

use crate::device::Device;

pub use controller::LinkController;
pub use serial_link::{ConnectionStream, LinkSettings, SerialLink};

/// Message surfaced when a channel ends without reporting an error
pub const CONNECTION_LOST: &str = "Connection lost";

/// Events emitted by an active or attempted link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionResult {
    /// Handshake completed; the channel is usable
    Established,
    /// One line was received from the remote device
    TransferSucceeded(String),
    /// The link failed or was rejected; terminal for the attempt
    Error(String),
}

impl ConnectionResult {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionResult::Error(_))
    }
}

/// Derived link state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum LinkState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Link-side flags owned by the controller
///
/// `epoch` identifies the subscription whose events may still change this
/// status; 0 means none may.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkStatus {
    pub state: LinkState,
    pub epoch: u64,
    pub device: Option<Device>,
    pub error_message: Option<String>,
    pub messages: Vec<String>,
}

impl LinkStatus {
    pub fn is_connected(&self) -> bool {
        self.state == LinkState::Connected
    }

    pub fn is_connecting(&self) -> bool {
        self.state == LinkState::Connecting
    }
}
