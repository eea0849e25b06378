//! # Discovery Scanner
//!
//! Drives the platform scan lifecycle and feeds found devices into the
//! [`DeviceRegistry`].
//!
//! A running scan is held by a `ScanSession`; dropping the session stops the
//! platform scan, so the scan is released on every exit path (explicit
//! `stop()`, restart, or the scanner itself being dropped).

use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::registry::DeviceRegistry;
use crate::error::{JoyLinkError, Result};
use crate::platform::BluetoothAdapter;

/// Platform scan scoped to this value's lifetime
struct ScanSession {
    adapter: Arc<dyn BluetoothAdapter>,
    cancel: CancellationToken,
    forward: JoinHandle<()>,
}

impl ScanSession {
    fn is_running(&self) -> bool {
        !self.forward.is_finished()
    }
}

impl Drop for ScanSession {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.forward.abort();
        self.adapter.stop_scan();
        debug!("Platform scan released");
    }
}

/// Scan lifecycle owner
pub struct DiscoveryScanner {
    adapter: Arc<dyn BluetoothAdapter>,
    registry: Arc<DeviceRegistry>,
    started: Arc<watch::Sender<bool>>,
    session: Mutex<Option<ScanSession>>,
}

impl std::fmt::Debug for DiscoveryScanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryScanner")
            .field("started", &*self.started.borrow())
            .finish_non_exhaustive()
    }
}

impl DiscoveryScanner {
    pub fn new(adapter: Arc<dyn BluetoothAdapter>, registry: Arc<DeviceRegistry>) -> Self {
        let (started, _) = watch::channel(false);
        Self {
            adapter,
            registry,
            started: Arc::new(started),
            session: Mutex::new(None),
        }
    }

    fn lock_session(&self) -> MutexGuard<'_, Option<ScanSession>> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reload the paired set from the platform; failures are logged only
    pub fn refresh_paired(&self) {
        match self.adapter.paired_devices() {
            Ok(devices) => self.registry.record_paired(devices),
            Err(e) => warn!("Failed to load paired devices: {}", e),
        }
    }

    /// Start scanning
    ///
    /// No-op while a scan is already running. Otherwise clears the
    /// discovered set, starts the platform scan and raises the started flag.
    ///
    /// # Errors
    ///
    /// Returns `Discovery` if the adapter is off or refuses to scan; the
    /// started flag stays down in that case.
    pub fn start(&self) -> Result<()> {
        let mut session = self.lock_session();
        if session.as_ref().is_some_and(ScanSession::is_running) {
            debug!("Discovery already running");
            return Ok(());
        }
        // A session whose platform stream ended still owns the scan handle
        session.take();

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| JoyLinkError::Discovery("discovery requires a tokio runtime".to_string()))?;

        if !self.adapter.is_enabled() {
            warn!("Bluetooth adapter is disabled, discovery not started");
            return Err(JoyLinkError::Discovery("Bluetooth adapter is disabled".to_string()));
        }

        self.refresh_paired();
        self.registry.clear_discovered();

        let mut found = self.adapter.start_scan().map_err(|e| {
            warn!("Platform refused to scan: {}", e);
            match e {
                JoyLinkError::Discovery(_) => e,
                other => JoyLinkError::Discovery(other.to_string()),
            }
        })?;

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let registry = Arc::clone(&self.registry);
        let started = Arc::clone(&self.started);
        self.started.send_replace(true);

        let forward = runtime.spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return,
                    next = found.recv() => match next {
                        Some(device) => {
                            debug!("Device found: {}", device);
                            registry.record_discovered(device);
                        }
                        None => {
                            if !token.is_cancelled() {
                                info!("Platform scan finished");
                                started.send_replace(false);
                            }
                            return;
                        }
                    }
                }
            }
        });

        *session = Some(ScanSession {
            adapter: Arc::clone(&self.adapter),
            cancel,
            forward,
        });
        info!("Discovery started");
        Ok(())
    }

    /// Stop scanning. Safe to call when nothing is running.
    pub fn stop(&self) {
        let session = self.lock_session().take();
        if let Some(session) = session {
            drop(session);
            info!("Discovery stopped");
        }
        self.started.send_replace(false);
    }

    pub fn is_started(&self) -> bool {
        *self.started.borrow()
    }

    /// Live view of the "scan in progress" flag
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.started.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use crate::platform::fakes::FakeAdapter;
    use crate::platform::MockBluetoothAdapter;
    use crate::test_support::{settle, wait_until};
    use tokio::sync::mpsc;

    fn scanner_with(adapter: Arc<FakeAdapter>) -> (DiscoveryScanner, Arc<DeviceRegistry>) {
        let registry = Arc::new(DeviceRegistry::new());
        (DiscoveryScanner::new(adapter, Arc::clone(&registry)), registry)
    }

    #[tokio::test]
    async fn test_found_device_lands_in_registry() {
        let adapter = FakeAdapter::new();
        let (scanner, registry) = scanner_with(Arc::clone(&adapter));

        scanner.start().unwrap();
        assert!(scanner.is_started());
        assert!(adapter.report(Device::named("00:11:22", "HC-06")).await);

        wait_until("device recorded", || !registry.discovered().is_empty()).await;
        let discovered = registry.discovered();
        assert_eq!(discovered.len(), 1);
        assert_eq!(discovered.as_slice()[0].address, "00:11:22");
        assert_eq!(discovered.as_slice()[0].name.as_deref(), Some("HC-06"));
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let adapter = FakeAdapter::new();
        let (scanner, registry) = scanner_with(Arc::clone(&adapter));

        scanner.start().unwrap();
        adapter.report(Device::named("AA", "a")).await;
        wait_until("device recorded", || registry.discovered().contains("AA")).await;

        scanner.start().unwrap();
        assert_eq!(adapter.scans_started(), 1);
        // The running scan's results are not cleared
        assert!(registry.discovered().contains("AA"));
    }

    #[tokio::test]
    async fn test_restart_clears_previous_results() {
        let adapter = FakeAdapter::new();
        let (scanner, registry) = scanner_with(Arc::clone(&adapter));

        scanner.start().unwrap();
        adapter.report(Device::named("AA", "a")).await;
        wait_until("first device", || registry.discovered().contains("AA")).await;
        scanner.stop();

        scanner.start().unwrap();
        assert!(registry.discovered().is_empty());
        adapter.report(Device::named("BB", "b")).await;
        wait_until("second device", || registry.discovered().contains("BB")).await;
        assert_eq!(registry.discovered().len(), 1);
    }

    #[tokio::test]
    async fn test_stop_twice_matches_stop_once() {
        let adapter = FakeAdapter::new();
        let (scanner, _registry) = scanner_with(Arc::clone(&adapter));

        scanner.start().unwrap();
        scanner.stop();
        assert!(!scanner.is_started());
        assert_eq!(adapter.scans_stopped(), 1);

        scanner.stop();
        assert!(!scanner.is_started());
        assert_eq!(adapter.scans_stopped(), 1);
    }

    #[tokio::test]
    async fn test_stop_without_scan_is_safe() {
        let adapter = FakeAdapter::new();
        let (scanner, _registry) = scanner_with(Arc::clone(&adapter));
        scanner.stop();
        assert!(!scanner.is_started());
        assert_eq!(adapter.scans_stopped(), 0);
    }

    #[tokio::test]
    async fn test_disabled_adapter_does_not_start() {
        let adapter = FakeAdapter::new();
        adapter.set_enabled(false);
        let (scanner, _registry) = scanner_with(Arc::clone(&adapter));

        assert!(matches!(scanner.start(), Err(JoyLinkError::Discovery(_))));
        assert!(!scanner.is_started());
        assert_eq!(adapter.scans_started(), 0);
    }

    #[tokio::test]
    async fn test_refused_scan_does_not_start() {
        let adapter = FakeAdapter::new();
        adapter.fail_scans("permission denied");
        let (scanner, _registry) = scanner_with(Arc::clone(&adapter));

        match scanner.start() {
            Err(JoyLinkError::Discovery(msg)) => assert!(msg.contains("permission denied")),
            other => panic!("Expected Discovery error, got: {:?}", other),
        }
        assert!(!scanner.is_started());
    }

    #[tokio::test]
    async fn test_natural_scan_end_lowers_flag_and_allows_restart() {
        let adapter = FakeAdapter::new();
        let (scanner, _registry) = scanner_with(Arc::clone(&adapter));

        scanner.start().unwrap();
        adapter.end_scan();
        wait_until("flag lowered", || !scanner.is_started()).await;

        scanner.start().unwrap();
        assert!(scanner.is_started());
        assert_eq!(adapter.scans_started(), 2);
    }

    #[tokio::test]
    async fn test_start_refreshes_paired_devices() {
        let adapter = FakeAdapter::new();
        adapter.set_paired(vec![Device::named("PP", "paired")]);
        let (scanner, registry) = scanner_with(Arc::clone(&adapter));

        scanner.start().unwrap();
        assert!(registry.paired().contains("PP"));
    }

    #[tokio::test]
    async fn test_late_reports_after_stop_are_ignored() {
        let adapter = FakeAdapter::new();
        let (scanner, registry) = scanner_with(Arc::clone(&adapter));

        scanner.start().unwrap();
        scanner.stop();
        assert!(!adapter.report(Device::named("AA", "a")).await);
        settle().await;
        assert!(registry.discovered().is_empty());
    }

    #[tokio::test]
    async fn test_dropping_scanner_stops_platform_scan() {
        let mut mock = MockBluetoothAdapter::new();
        mock.expect_is_enabled().return_const(true);
        mock.expect_paired_devices()
            .returning(|| Ok(vec![Device::named("PP", "paired")]));

        let platform_side = Arc::new(Mutex::new(None));
        let keep = Arc::clone(&platform_side);
        mock.expect_start_scan().times(1).returning(move || {
            let (tx, rx) = mpsc::channel(4);
            *keep.lock().unwrap() = Some(tx);
            Ok(rx)
        });
        mock.expect_stop_scan().times(1).return_const(());

        let registry = Arc::new(DeviceRegistry::new());
        let scanner = DiscoveryScanner::new(Arc::new(mock), Arc::clone(&registry));
        scanner.start().unwrap();
        assert!(registry.paired().contains("PP"));

        // Mock expectations are verified when the last Arc is released
        drop(scanner);
    }

    #[test]
    fn test_start_outside_runtime_is_refused() {
        let adapter = FakeAdapter::new();
        let (scanner, _registry) = scanner_with(Arc::clone(&adapter));
        assert!(scanner.start().is_err());
        assert!(!scanner.is_started());
    }
}
