//! # Platform Module
//!
//! Capability interface to the host Bluetooth stack.
//!
//! Discovery and the serial link never touch the operating system directly;
//! they receive an [`BluetoothAdapter`] at construction so tests can swap in
//! an in-memory fake.

pub mod serial_port;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::device::Device;
use crate::error::Result;

pub use serial_port::SerialPortAdapter;

/// An open, connection-oriented byte channel to a remote device
///
/// Dropping both halves releases the underlying socket or port.
pub struct LinkChannel {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
}

impl LinkChannel {
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }

    /// Split a bidirectional stream into a channel
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(reader, writer)
    }
}

impl std::fmt::Debug for LinkChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkChannel").finish_non_exhaustive()
    }
}

/// Host Bluetooth capabilities used by discovery and the serial link
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BluetoothAdapter: Send + Sync {
    /// Whether the adapter is powered and usable
    fn is_enabled(&self) -> bool;

    /// Devices bonded at the OS level, available without scanning
    fn paired_devices(&self) -> Result<Vec<Device>>;

    /// Begin a platform scan and return the stream of found devices
    ///
    /// The stream ends when the platform scan ends. Dropping the receiver
    /// tells the platform side nobody is listening any more.
    fn start_scan(&self) -> Result<mpsc::Receiver<Device>>;

    /// Halt the platform scan. Safe to call when no scan is running.
    fn stop_scan(&self);

    /// Open the serial service of `device`; may suspend for the handshake
    async fn open(&self, device: &Device) -> Result<LinkChannel>;
}
