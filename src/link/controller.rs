//! # Link Controller
//!
//! Orchestrates discovery and the serial link, and owns the link-side
//! status the UI projection reads.
//!
//! Every `connect` starts a new subscription tagged with the link's epoch.
//! Events are applied only while the status still carries that epoch, so a
//! superseded or disconnected attempt can never change what the UI shows.

use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::serial_link::{ConnectionStream, LinkSettings, SerialLink};
use super::{ConnectionResult, LinkState, LinkStatus, CONNECTION_LOST};
use crate::device::Device;
use crate::discovery::{DeviceRegistry, DiscoveryScanner};
use crate::error::{JoyLinkError, Result};
use crate::platform::BluetoothAdapter;
use crate::ui_state::{project, UiState, UiStateWatch};

/// Background job forwarding one connection's events into the status
struct Listener {
    epoch: u64,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
        debug!("Listener for link #{} stopped", self.epoch);
    }
}

/// Entry point used by the UI layer
pub struct LinkController {
    link: Arc<SerialLink>,
    scanner: DiscoveryScanner,
    registry: Arc<DeviceRegistry>,
    status: Arc<watch::Sender<LinkStatus>>,
    listener: Mutex<Option<Listener>>,
}

impl std::fmt::Debug for LinkController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkController")
            .field("status", &*self.status.borrow())
            .field("scanner", &self.scanner)
            .finish_non_exhaustive()
    }
}

impl LinkController {
    /// Create a controller and load the paired set
    pub fn new(adapter: Arc<dyn BluetoothAdapter>, settings: LinkSettings) -> Self {
        let registry = Arc::new(DeviceRegistry::new());
        let scanner = DiscoveryScanner::new(Arc::clone(&adapter), Arc::clone(&registry));
        scanner.refresh_paired();

        let (status, _) = watch::channel(LinkStatus::default());
        Self {
            link: Arc::new(SerialLink::new(adapter, settings)),
            scanner,
            registry,
            status: Arc::new(status),
            listener: Mutex::new(None),
        }
    }

    fn lock_listener(&self) -> MutexGuard<'_, Option<Listener>> {
        self.listener.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start discovery; returns whether a scan is now running
    pub fn start_discovery(&self) -> bool {
        match self.scanner.start() {
            Ok(()) => true,
            Err(e) => {
                warn!("Discovery not started: {}", e);
                false
            }
        }
    }

    pub fn stop_discovery(&self) {
        self.scanner.stop();
    }

    /// Connect to `device`, superseding any previous attempt
    ///
    /// Returns immediately with the attempt's epoch; progress is reported
    /// through the status and [`UiStateWatch`].
    pub fn connect(&self, device: Device) -> u64 {
        let mut listener = self.lock_listener();
        // Stop the previous subscription before its link is replaced
        listener.take();

        let stream = self.link.connect(&device);
        let epoch = stream.epoch();
        debug!("Tracking link #{} to {}", epoch, device);

        self.status.send_modify(|status| {
            status.state = LinkState::Connecting;
            status.epoch = epoch;
            status.device = Some(device);
            status.messages.clear();
        });

        let cancel = CancellationToken::new();
        let task = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => Some(runtime.spawn(listen(
                stream,
                cancel.clone(),
                Arc::clone(&self.status),
                Arc::clone(&self.link),
            ))),
            Err(_) => {
                let event = ConnectionResult::Error("No async runtime available".to_string());
                if apply_event(&self.status, epoch, event) {
                    self.link.close_epoch(epoch);
                }
                None
            }
        };

        *listener = Some(Listener {
            epoch,
            cancel,
            task,
        });
        epoch
    }

    /// Tear down the current link and clear the transcript
    ///
    /// Safe to call in any state; a second call changes nothing.
    pub fn disconnect(&self) {
        let mut listener = self.lock_listener();
        listener.take();
        self.link.close();

        let changed = self.status.send_if_modified(|status| {
            let changed = status.state != LinkState::Disconnected
                || status.epoch != 0
                || status.device.is_some()
                || !status.messages.is_empty();
            status.state = LinkState::Disconnected;
            status.epoch = 0;
            status.device = None;
            status.messages.clear();
            changed
        });
        if changed {
            info!("Disconnected");
        }
    }

    /// Queue a message for the connected device
    ///
    /// Returns `false` when there is no established link or the send queue
    /// is full. A refused send never changes the link state.
    pub fn send(&self, message: &str) -> bool {
        let accepted = self.link.send(message);
        if !accepted {
            if self.status.borrow().is_connected() {
                warn!("Send failed: {:?}", message);
            } else {
                debug!("Send ignored while not connected: {:?}", message);
            }
        }
        accepted
    }

    pub fn status(&self) -> LinkStatus {
        self.status.borrow().clone()
    }

    pub fn link_state(&self) -> LinkState {
        self.status.borrow().state
    }

    /// Look up a known device by address, discovered entries first
    pub fn find_device(&self, address: &str) -> Option<Device> {
        self.registry.find(address)
    }

    /// Pick the device to connect to
    ///
    /// A configured `target` address wins, even when it has not been seen
    /// yet. Otherwise the first paired device, then the first discovered.
    ///
    /// # Errors
    ///
    /// Returns `DeviceNotFound` when there is no target and no known device.
    pub fn choose_device(&self, target: Option<&str>) -> Result<Device> {
        if let Some(address) = target {
            return Ok(self
                .find_device(address)
                .unwrap_or_else(|| Device::new(address, None)));
        }

        let paired = self.registry.paired();
        let discovered = self.registry.discovered();
        paired
            .iter()
            .chain(discovered.iter())
            .next()
            .cloned()
            .ok_or_else(|| JoyLinkError::DeviceNotFound("no paired or discovered device".to_string()))
    }

    /// Current UI snapshot
    pub fn ui_state(&self) -> UiState {
        project(
            &self.registry.paired(),
            &self.registry.discovered(),
            self.scanner.is_started(),
            &self.status.borrow(),
        )
    }

    /// Live UI snapshots
    pub fn subscribe(&self) -> UiStateWatch {
        UiStateWatch::new(
            self.registry.subscribe(),
            self.scanner.subscribe(),
            self.status.subscribe(),
        )
    }
}

impl Drop for LinkController {
    fn drop(&mut self) {
        self.lock_listener().take();
        self.link.close();
        self.scanner.stop();
    }
}

/// Forward one attempt's events until it ends or is superseded
async fn listen(
    mut stream: ConnectionStream,
    cancel: CancellationToken,
    status: Arc<watch::Sender<LinkStatus>>,
    link: Arc<SerialLink>,
) {
    let epoch = stream.epoch();
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            event = stream.next() => event,
        };

        let event = match event {
            Some(event) => event,
            None if cancel.is_cancelled() || stream.is_cancelled() => return,
            None => {
                debug!("Link #{} ended without reporting an error", epoch);
                ConnectionResult::Error(CONNECTION_LOST.to_string())
            }
        };

        let terminal = event.is_terminal();
        if !apply_event(&status, epoch, event) {
            debug!("Dropping event from superseded link #{}", epoch);
            return;
        }
        if terminal {
            link.close_epoch(epoch);
            return;
        }
    }
}

/// Apply `event` if `epoch` is still the live subscription
///
/// Returns `false` when the event was stale and ignored.
fn apply_event(status: &watch::Sender<LinkStatus>, epoch: u64, event: ConnectionResult) -> bool {
    let mut current = false;
    status.send_if_modified(|status| {
        if epoch == 0 || status.epoch != epoch {
            return false;
        }
        current = true;
        match event {
            ConnectionResult::Established => {
                debug!("Link #{} established", epoch);
                status.state = LinkState::Connected;
                status.error_message = None;
            }
            ConnectionResult::TransferSucceeded(message) => {
                debug!("Received: {:?}", message);
                status.messages.push(message);
            }
            ConnectionResult::Error(message) => {
                warn!("Link #{} failed: {}", epoch, message);
                status.state = LinkState::Disconnected;
                status.epoch = 0;
                status.device = None;
                status.error_message = Some(message);
                status.messages.clear();
            }
        }
        true
    });
    current
}
