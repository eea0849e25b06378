//! # Serial Port Adapter
//!
//! [`BluetoothAdapter`] for classic Bluetooth SPP devices that the operating
//! system exposes as serial ports:
//! - Linux: `rfcomm bind` creates `/dev/rfcommN`; opening the node performs
//!   the RFCOMM handshake
//! - macOS: paired SPP devices appear as `/dev/cu.<name>-<service>`
//!
//! The port path is the device address. Scanning polls the port list and
//! reports ports as they appear.

use async_trait::async_trait;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_serial::{SerialPortBuilderExt, SerialPortInfo, SerialPortType};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{BluetoothAdapter, LinkChannel};
use crate::config::Config;
use crate::device::Device;
use crate::error::{JoyLinkError, Result};

/// Buffered found-device events between the poller and the scanner
const SCAN_CHANNEL_CAPACITY: usize = 32;

/// Serial-port backed Bluetooth adapter
pub struct SerialPortAdapter {
    baud_rate: u32,
    patterns: Vec<String>,
    poll_interval: Duration,
    scan: Mutex<Option<CancellationToken>>,
}

impl std::fmt::Debug for SerialPortAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialPortAdapter")
            .field("baud_rate", &self.baud_rate)
            .field("patterns", &self.patterns)
            .finish_non_exhaustive()
    }
}

impl SerialPortAdapter {
    /// Create an adapter
    ///
    /// # Arguments
    ///
    /// * `baud_rate` - Line speed used when opening a device (HC-05/HC-06 default to 9600)
    /// * `patterns` - Substrings of port paths that identify Bluetooth serial ports
    /// * `poll_interval` - How often the port list is re-read while scanning
    pub fn new(baud_rate: u32, patterns: Vec<String>, poll_interval: Duration) -> Self {
        Self {
            baud_rate,
            patterns,
            poll_interval,
            scan: Mutex::new(None),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.link.baud_rate,
            config.discovery.port_patterns.clone(),
            config.discovery.poll_interval(),
        )
    }

    fn list_ports() -> Result<Vec<SerialPortInfo>> {
        tokio_serial::available_ports()
            .map_err(|e| JoyLinkError::Serial(format!("Failed to enumerate serial ports: {}", e)))
    }

    /// Open a specific serial port with SPP line settings (8N1, no flow control)
    fn open_port(path: &str, baud_rate: u32) -> Result<tokio_serial::SerialStream> {
        let port = tokio_serial::new(path, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| JoyLinkError::Serial(format!("Failed to open {}: {}", path, e)))?;

        Ok(port)
    }
}

/// Select the ports that look like Bluetooth serial links
fn candidate_devices(ports: &[SerialPortInfo], patterns: &[String]) -> Vec<Device> {
    ports
        .iter()
        .filter(|info| {
            matches!(info.port_type, SerialPortType::BluetoothPort)
                || patterns.iter().any(|p| info.port_name.contains(p.as_str()))
        })
        .map(port_device)
        .collect()
}

fn port_device(info: &SerialPortInfo) -> Device {
    let product = match &info.port_type {
        SerialPortType::UsbPort(usb) => usb.product.clone(),
        _ => None,
    };
    let name = product.or_else(|| {
        Path::new(&info.port_name)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
    });
    Device::new(info.port_name.clone(), name)
}

#[async_trait]
impl BluetoothAdapter for SerialPortAdapter {
    fn is_enabled(&self) -> bool {
        Self::list_ports().is_ok()
    }

    fn paired_devices(&self) -> Result<Vec<Device>> {
        let ports = Self::list_ports()?;
        Ok(candidate_devices(&ports, &self.patterns))
    }

    fn start_scan(&self) -> Result<mpsc::Receiver<Device>> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| JoyLinkError::Discovery("scanning requires a tokio runtime".to_string()))?;
        Self::list_ports().map_err(|e| JoyLinkError::Discovery(e.to_string()))?;

        let token = CancellationToken::new();
        let previous = self
            .scan
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(token.clone());
        if let Some(previous) = previous {
            previous.cancel();
        }

        let (tx, rx) = mpsc::channel(SCAN_CHANNEL_CAPACITY);
        let patterns = self.patterns.clone();
        let poll_interval = self.poll_interval;

        runtime.spawn(async move {
            let mut seen = HashSet::new();
            let mut ticker = tokio::time::interval(poll_interval);
            info!("Polling serial ports every {:?}", poll_interval);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tx.closed() => break,
                    _ = ticker.tick() => {
                        let ports = match tokio::task::spawn_blocking(tokio_serial::available_ports).await {
                            Ok(Ok(ports)) => ports,
                            Ok(Err(e)) => {
                                warn!("Failed to enumerate serial ports: {}", e);
                                continue;
                            }
                            Err(e) => {
                                warn!("Port enumeration task failed: {}", e);
                                continue;
                            }
                        };

                        for device in candidate_devices(&ports, &patterns) {
                            if seen.insert(device.address.clone()) {
                                debug!("Found serial device {}", device);
                                if tx.send(device).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                }
            }

            debug!("Serial port polling stopped");
        });

        Ok(rx)
    }

    fn stop_scan(&self) {
        let token = self.scan.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(token) = token {
            token.cancel();
        }
    }

    async fn open(&self, device: &Device) -> Result<LinkChannel> {
        let path = device.address.clone();
        let baud_rate = self.baud_rate;
        debug!("Opening {} at {} baud", path, baud_rate);

        let port = tokio::task::spawn_blocking(move || Self::open_port(&path, baud_rate))
            .await
            .map_err(|e| JoyLinkError::Connection(format!("Serial open task failed: {}", e)))??;

        info!("Opened serial link to {}", device);
        Ok(LinkChannel::from_stream(port))
    }
}

impl Drop for SerialPortAdapter {
    fn drop(&mut self) {
        self.stop_scan();
    }
}
