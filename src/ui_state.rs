//! # UI State Projection
//!
//! Combines the registry sets, the discovery flag and the link status into
//! one immutable [`UiState`] snapshot. The projection owns no state except
//! the last snapshot a [`UiStateWatch`] handed out.

use serde::Serialize;
use tokio::sync::watch;

use crate::device::DeviceSet;
use crate::discovery::RegistryWatch;
use crate::link::LinkStatus;

/// Snapshot rendered by the UI
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UiState {
    pub scanned_devices: DeviceSet,
    pub paired_devices: DeviceSet,
    pub is_discover_started: bool,
    pub is_connected: bool,
    pub is_connecting: bool,
    pub error_message: Option<String>,
    pub messages: Vec<String>,
}

/// Build a snapshot. The message transcript only survives while connected.
pub fn project(
    paired: &DeviceSet,
    discovered: &DeviceSet,
    is_discover_started: bool,
    status: &LinkStatus,
) -> UiState {
    let is_connected = status.is_connected();
    UiState {
        scanned_devices: discovered.clone(),
        paired_devices: paired.clone(),
        is_discover_started,
        is_connected,
        is_connecting: status.is_connecting(),
        error_message: status.error_message.clone(),
        messages: if is_connected {
            status.messages.clone()
        } else {
            Vec::new()
        },
    }
}

/// Live UI state, re-projected whenever any source changes
#[derive(Debug)]
pub struct UiStateWatch {
    registry: RegistryWatch,
    discovering: watch::Receiver<bool>,
    status: watch::Receiver<LinkStatus>,
    last: Option<UiState>,
}

impl UiStateWatch {
    pub fn new(
        registry: RegistryWatch,
        discovering: watch::Receiver<bool>,
        status: watch::Receiver<LinkStatus>,
    ) -> Self {
        Self {
            registry,
            discovering,
            status,
            last: None,
        }
    }

    fn snapshot(&mut self) -> UiState {
        project(
            &self.registry.paired.borrow_and_update(),
            &self.registry.discovered.borrow_and_update(),
            *self.discovering.borrow_and_update(),
            &self.status.borrow_and_update(),
        )
    }

    /// The current snapshot
    pub fn current(&mut self) -> UiState {
        let snapshot = self.snapshot();
        self.last = Some(snapshot.clone());
        snapshot
    }

    /// Wait for the next snapshot that differs from the last one emitted
    ///
    /// Returns `None` once every source has gone away.
    pub async fn changed(&mut self) -> Option<UiState> {
        loop {
            tokio::select! {
                Ok(()) = self.registry.paired.changed() => {}
                Ok(()) = self.registry.discovered.changed() => {}
                Ok(()) = self.discovering.changed() => {}
                Ok(()) = self.status.changed() => {}
                else => return None,
            }

            let snapshot = self.snapshot();
            if self.last.as_ref() != Some(&snapshot) {
                self.last = Some(snapshot.clone());
                return Some(snapshot);
            }
        }
    }
}
