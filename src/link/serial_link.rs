//! # Serial Link
//!
//! Owns at most one channel to a remote device.
//!
//! `connect` spawns a background task that performs the handshake, emits
//! [`ConnectionResult::Established`], then multiplexes the read loop with
//! the outbound send queue until the channel closes or the link is
//! cancelled. The UI-side caller never blocks: `connect` returns a
//! [`ConnectionStream`] immediately and `send` only enqueues.
//!
//! Teardown happens when the `ActiveLink` is dropped: its token is cancelled
//! and its task aborted, which drops both halves of the channel.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ConnectionResult, CONNECTION_LOST};
use crate::config::LinkConfig;
use crate::device::Device;
use crate::error::JoyLinkError;
use crate::platform::{BluetoothAdapter, LinkChannel};

/// Events buffered between the read loop and the subscriber
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Longest inbound line; longer input is surfaced in chunks of this size
pub const MAX_LINE_LEN: usize = 1024;

/// Timing and queueing parameters for a link
#[derive(Debug, Clone)]
pub struct LinkSettings {
    pub connect_timeout: Duration,
    pub send_queue_capacity: usize,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            send_queue_capacity: 32,
        }
    }
}

impl LinkSettings {
    pub fn from_config(config: &LinkConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            send_queue_capacity: config.send_queue_capacity,
        }
    }
}

/// Event stream of one connection attempt
///
/// Yields nothing once the attempt has been cancelled, even if events were
/// still buffered.
#[derive(Debug)]
pub struct ConnectionStream {
    epoch: u64,
    cancel: CancellationToken,
    events: mpsc::Receiver<ConnectionResult>,
}

impl ConnectionStream {
    /// Sequence number of the attempt that produced this stream
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Next event, or `None` when the attempt ended or was cancelled
    pub async fn next(&mut self) -> Option<ConnectionResult> {
        if self.cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            event = self.events.recv() => event,
        }
    }
}

/// The live attempt; dropping it tears the channel down
struct ActiveLink {
    epoch: u64,
    device: Device,
    cancel: CancellationToken,
    outbound: mpsc::Sender<String>,
    established: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl Drop for ActiveLink {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
        debug!("Released link #{} to {}", self.epoch, self.device);
    }
}

/// Exclusive serial link to one remote device
pub struct SerialLink {
    adapter: Arc<dyn BluetoothAdapter>,
    settings: LinkSettings,
    active: Mutex<Option<ActiveLink>>,
    epoch: AtomicU64,
}

impl std::fmt::Debug for SerialLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialLink")
            .field("settings", &self.settings)
            .field("epoch", &self.epoch.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl SerialLink {
    pub fn new(adapter: Arc<dyn BluetoothAdapter>, settings: LinkSettings) -> Self {
        Self {
            adapter,
            settings,
            active: Mutex::new(None),
            epoch: AtomicU64::new(0),
        }
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<ActiveLink>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Open a channel to `device`
    ///
    /// Any previous attempt is closed first. The returned stream carries
    /// exactly one `Established` or `Error` for the handshake, then one
    /// `TransferSucceeded` per received line, and ends with an `Error` when
    /// the channel goes away.
    pub fn connect(&self, device: &Device) -> ConnectionStream {
        let mut active = self.lock_active();
        if let Some(previous) = active.take() {
            info!("Closing link to {} before connecting to {}", previous.device, device);
        }

        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::channel(self.settings.send_queue_capacity.max(1));
        let established = Arc::new(AtomicBool::new(false));

        info!("Connecting to {} (attempt #{})", device, epoch);
        let task = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => Some(runtime.spawn(run_link(LinkTask {
                adapter: Arc::clone(&self.adapter),
                device: device.clone(),
                connect_timeout: self.settings.connect_timeout,
                cancel: cancel.clone(),
                events: events_tx,
                outbound: outbound_rx,
                established: Arc::clone(&established),
            }))),
            Err(_) => {
                let _ = events_tx.try_send(ConnectionResult::Error(
                    "No async runtime available".to_string(),
                ));
                None
            }
        };

        *active = Some(ActiveLink {
            epoch,
            device: device.clone(),
            cancel: cancel.clone(),
            outbound: outbound_tx,
            established,
            task,
        });

        ConnectionStream {
            epoch,
            cancel,
            events: events_rx,
        }
    }

    /// Queue `message` for transmission, verbatim
    ///
    /// Returns `true` when the link accepted the message. `false` means no
    /// established link or a full send queue; it says nothing about whether
    /// the remote device processed anything.
    pub fn send(&self, message: &str) -> bool {
        let active = self.lock_active();
        let Some(link) = active.as_ref() else {
            debug!("Send with no active link");
            return false;
        };

        if !link.established.load(Ordering::SeqCst) {
            debug!("Send before link #{} is established", link.epoch);
            return false;
        }

        match link.outbound.try_send(message.to_string()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("Send queue to {} is full, message dropped", link.device);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Release the channel unconditionally. Idempotent.
    pub fn close(&self) {
        let previous = self.lock_active().take();
        if let Some(link) = previous {
            info!("Closing link to {}", link.device);
        }
    }

    /// Close only if attempt `epoch` is still the active one
    pub fn close_epoch(&self, epoch: u64) -> bool {
        let mut active = self.lock_active();
        if active.as_ref().is_some_and(|link| link.epoch == epoch) {
            active.take();
            true
        } else {
            false
        }
    }

    pub fn is_active(&self) -> bool {
        self.lock_active().is_some()
    }

    pub fn is_established(&self) -> bool {
        self.lock_active()
            .as_ref()
            .is_some_and(|link| link.established.load(Ordering::SeqCst))
    }

    /// Kill the link task without cancelling its stream, as a crashed
    /// reader would
    #[cfg(test)]
    pub(crate) fn abort_task(&self) {
        if let Some(task) = self.lock_active().as_mut().and_then(|link| link.task.take()) {
            task.abort();
        }
    }
}

struct LinkTask {
    adapter: Arc<dyn BluetoothAdapter>,
    device: Device,
    connect_timeout: Duration,
    cancel: CancellationToken,
    events: mpsc::Sender<ConnectionResult>,
    outbound: mpsc::Receiver<String>,
    established: Arc<AtomicBool>,
}

/// Human-readable cause for a failed handshake
fn failure_reason(error: JoyLinkError) -> String {
    match error {
        JoyLinkError::Connection(reason) => reason,
        other => other.to_string(),
    }
}

/// Strip the line terminator (`\n` or `\r\n`) and decode lossily
fn take_line(buf: &mut Vec<u8>) -> String {
    if buf.last() == Some(&b'\n') {
        buf.pop();
    }
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    let line = String::from_utf8_lossy(buf).into_owned();
    buf.clear();
    line
}

async fn write_message<W: AsyncWrite + Unpin + ?Sized>(
    writer: &mut W,
    message: &str,
) -> std::io::Result<()> {
    writer.write_all(message.as_bytes()).await?;
    writer.flush().await
}

async fn emit(
    events: &mpsc::Sender<ConnectionResult>,
    cancel: &CancellationToken,
    event: ConnectionResult,
) -> bool {
    if cancel.is_cancelled() {
        return false;
    }
    events.send(event).await.is_ok()
}

async fn run_link(task: LinkTask) {
    let LinkTask {
        adapter,
        device,
        connect_timeout,
        cancel,
        events,
        mut outbound,
        established,
    } = task;

    let opened = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            debug!("Connect to {} cancelled", device);
            return;
        }
        opened = tokio::time::timeout(connect_timeout, adapter.open(&device)) => opened,
    };

    let LinkChannel { reader, mut writer } = match opened {
        Ok(Ok(channel)) => channel,
        Ok(Err(e)) => {
            warn!("Connection to {} failed: {}", device, e);
            emit(&events, &cancel, ConnectionResult::Error(failure_reason(e))).await;
            return;
        }
        Err(_) => {
            warn!("Connection to {} timed out after {:?}", device, connect_timeout);
            let reason = format!("Connection to {} timed out", device.address);
            emit(&events, &cancel, ConnectionResult::Error(reason)).await;
            return;
        }
    };

    established.store(true, Ordering::SeqCst);
    info!("Connected to {}", device);
    if !emit(&events, &cancel, ConnectionResult::Established).await {
        return;
    }

    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    loop {
        // Bytes left before the pending line is flushed as a chunk
        let remaining = MAX_LINE_LEN.saturating_sub(buf.len()).max(1) as u64;
        let mut limited = (&mut reader).take(remaining);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("Read loop for {} cancelled", device);
                break;
            }
            Some(message) = outbound.recv() => {
                if let Err(e) = write_message(&mut writer, &message).await {
                    warn!("Write to {} failed: {}", device, e);
                }
            }
            read = limited.read_until(b'\n', &mut buf) => match read {
                Ok(0) => {
                    info!("{} closed the channel", device);
                    emit(&events, &cancel, ConnectionResult::Error(CONNECTION_LOST.to_string())).await;
                    break;
                }
                Ok(_) => {
                    if buf.len() >= MAX_LINE_LEN && buf.last() != Some(&b'\n') {
                        warn!("Line from {} exceeds {} bytes, splitting", device, MAX_LINE_LEN);
                    }
                    let line = take_line(&mut buf);
                    debug!("Received from {}: {}", device, line);
                    if !emit(&events, &cancel, ConnectionResult::TransferSucceeded(line)).await {
                        break;
                    }
                }
                Err(e) => {
                    warn!("Read from {} failed: {}", device, e);
                    let reason = format!("{}: {}", CONNECTION_LOST, e);
                    emit(&events, &cancel, ConnectionResult::Error(reason)).await;
                    break;
                }
            }
        }
    }

    established.store(false, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::fakes::{ConnectPlan, FakeAdapter};
    use crate::test_support::settle;
    use tokio::io::AsyncReadExt;
    use tokio::sync::Notify;

    fn link_with(adapter: &Arc<FakeAdapter>) -> SerialLink {
        SerialLink::new(Arc::clone(adapter) as Arc<dyn BluetoothAdapter>, LinkSettings::default())
    }

    async fn next_event(stream: &mut ConnectionStream) -> Option<ConnectionResult> {
        tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("timed out waiting for a link event")
    }

    fn hc06() -> Device {
        Device::named("00:11:22", "HC-06")
    }

    #[tokio::test]
    async fn test_established_then_lines_in_order() {
        let adapter = FakeAdapter::new();
        let link = link_with(&adapter);

        let mut stream = link.connect(&hc06());
        assert_eq!(next_event(&mut stream).await, Some(ConnectionResult::Established));

        let mut remote = adapter.remote("00:11:22").await;
        remote.write_all(b"hello\r\nworld\n").await.unwrap();

        assert_eq!(
            next_event(&mut stream).await,
            Some(ConnectionResult::TransferSucceeded("hello".to_string()))
        );
        assert_eq!(
            next_event(&mut stream).await,
            Some(ConnectionResult::TransferSucceeded("world".to_string()))
        );
    }

    #[tokio::test]
    async fn test_send_writes_message_verbatim() {
        let adapter = FakeAdapter::new();
        let link = link_with(&adapter);

        let mut stream = link.connect(&hc06());
        assert_eq!(next_event(&mut stream).await, Some(ConnectionResult::Established));
        let mut remote = adapter.remote("00:11:22").await;

        assert!(link.send("12,-7\n"));
        assert!(link.send("0,0\n"));

        let mut received = [0u8; 10];
        remote.read_exact(&mut received).await.unwrap();
        assert_eq!(&received, b"12,-7\n0,0\n");
    }

    #[tokio::test]
    async fn test_send_without_link_is_rejected() {
        let adapter = FakeAdapter::new();
        let link = link_with(&adapter);
        assert!(!link.send("1,1\n"));
    }

    #[tokio::test]
    async fn test_send_during_handshake_is_rejected() {
        let adapter = FakeAdapter::new();
        adapter.plan("00:11:22", ConnectPlan::Gated(Arc::new(Notify::new())));
        let link = link_with(&adapter);

        let _stream = link.connect(&hc06());
        settle().await;
        assert!(link.is_active());
        assert!(!link.is_established());
        assert!(!link.send("1,1\n"));
    }

    #[tokio::test]
    async fn test_rejected_handshake_emits_single_error() {
        let adapter = FakeAdapter::new();
        adapter.plan("00:11:22", ConnectPlan::Reject("rejected".to_string()));
        let link = link_with(&adapter);

        let mut stream = link.connect(&hc06());
        assert_eq!(
            next_event(&mut stream).await,
            Some(ConnectionResult::Error("rejected".to_string()))
        );
        assert_eq!(next_event(&mut stream).await, None);
    }

    #[tokio::test]
    async fn test_handshake_timeout_is_an_error() {
        let adapter = FakeAdapter::new();
        adapter.plan("00:11:22", ConnectPlan::Gated(Arc::new(Notify::new())));
        let link = SerialLink::new(
            Arc::clone(&adapter) as Arc<dyn BluetoothAdapter>,
            LinkSettings {
                connect_timeout: Duration::from_millis(50),
                send_queue_capacity: 4,
            },
        );

        let mut stream = link.connect(&hc06());
        match next_event(&mut stream).await {
            Some(ConnectionResult::Error(reason)) => assert!(reason.contains("timed out")),
            other => panic!("Expected timeout error, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_remote_hangup_reports_connection_lost() {
        let adapter = FakeAdapter::new();
        let link = link_with(&adapter);

        let mut stream = link.connect(&hc06());
        assert_eq!(next_event(&mut stream).await, Some(ConnectionResult::Established));
        drop(adapter.remote("00:11:22").await);

        assert_eq!(
            next_event(&mut stream).await,
            Some(ConnectionResult::Error(CONNECTION_LOST.to_string()))
        );
        assert_eq!(next_event(&mut stream).await, None);
    }

    #[tokio::test]
    async fn test_overlong_line_is_split() {
        let adapter = FakeAdapter::new();
        let link = link_with(&adapter);

        let mut stream = link.connect(&hc06());
        assert_eq!(next_event(&mut stream).await, Some(ConnectionResult::Established));
        let mut remote = adapter.remote("00:11:22").await;

        let mut payload = vec![b'a'; MAX_LINE_LEN + 476];
        payload.push(b'\n');
        remote.write_all(&payload).await.unwrap();

        assert_eq!(
            next_event(&mut stream).await,
            Some(ConnectionResult::TransferSucceeded("a".repeat(MAX_LINE_LEN)))
        );
        assert_eq!(
            next_event(&mut stream).await,
            Some(ConnectionResult::TransferSucceeded("a".repeat(476)))
        );
        assert!(link.is_established());
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_decoded_lossily() {
        let adapter = FakeAdapter::new();
        let link = link_with(&adapter);

        let mut stream = link.connect(&hc06());
        assert_eq!(next_event(&mut stream).await, Some(ConnectionResult::Established));
        let mut remote = adapter.remote("00:11:22").await;
        remote.write_all(&[0xff, b'o', b'k', b'\n']).await.unwrap();

        assert_eq!(
            next_event(&mut stream).await,
            Some(ConnectionResult::TransferSucceeded("\u{FFFD}ok".to_string()))
        );
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_releases_once() {
        let adapter = FakeAdapter::new();
        let link = link_with(&adapter);

        let mut stream = link.connect(&hc06());
        assert_eq!(next_event(&mut stream).await, Some(ConnectionResult::Established));
        let mut remote = adapter.remote("00:11:22").await;

        link.close();
        link.close();
        assert!(!link.is_active());
        assert!(stream.is_cancelled());

        // Lines sent after close never surface
        let _ = remote.write_all(b"late\n").await;
        assert_eq!(next_event(&mut stream).await, None);

        let mut rest = Vec::new();
        remote.read_to_end(&mut rest).await.unwrap();
        assert_eq!(adapter.close_count("00:11:22"), 1);
    }

    #[tokio::test]
    async fn test_close_without_link_is_safe() {
        let adapter = FakeAdapter::new();
        let link = link_with(&adapter);
        link.close();
        assert!(!link.is_active());
    }

    #[tokio::test]
    async fn test_reconnect_cancels_pending_attempt() {
        let adapter = FakeAdapter::new();
        let gate = Arc::new(Notify::new());
        adapter.plan("AA", ConnectPlan::Gated(Arc::clone(&gate)));
        let link = link_with(&adapter);

        let mut first = link.connect(&Device::named("AA", "first"));
        let mut second = link.connect(&Device::named("BB", "second"));
        gate.notify_one();

        assert_eq!(next_event(&mut second).await, Some(ConnectionResult::Established));
        assert_eq!(next_event(&mut first).await, None);
        assert!(first.epoch() < second.epoch());
        settle().await;
        assert_eq!(adapter.close_count("AA"), 0);
    }

    #[tokio::test]
    async fn test_reconnect_closes_established_channel() {
        let adapter = FakeAdapter::new();
        let link = link_with(&adapter);

        let mut first = link.connect(&Device::named("AA", "first"));
        assert_eq!(next_event(&mut first).await, Some(ConnectionResult::Established));

        let mut second = link.connect(&Device::named("BB", "second"));
        assert_eq!(next_event(&mut second).await, Some(ConnectionResult::Established));
        assert_eq!(next_event(&mut first).await, None);

        let mut old_remote = adapter.remote("AA").await;
        let mut rest = Vec::new();
        old_remote.read_to_end(&mut rest).await.unwrap();
        assert_eq!(adapter.close_count("AA"), 1);
    }

    #[tokio::test]
    async fn test_close_epoch_ignores_superseded_attempt() {
        let adapter = FakeAdapter::new();
        let link = link_with(&adapter);

        let first = link.connect(&Device::named("AA", "first"));
        let second = link.connect(&Device::named("BB", "second"));

        assert!(!link.close_epoch(first.epoch()));
        assert!(link.is_active());
        assert!(link.close_epoch(second.epoch()));
        assert!(!link.is_active());
    }

    #[test]
    fn test_take_line_strips_terminators() {
        let mut buf = b"abc\r\n".to_vec();
        assert_eq!(take_line(&mut buf), "abc");
        assert!(buf.is_empty());

        let mut buf = b"partial".to_vec();
        assert_eq!(take_line(&mut buf), "partial");
    }

    #[test]
    fn test_failure_reason_unwraps_connection_errors() {
        assert_eq!(failure_reason(JoyLinkError::Connection("rejected".into())), "rejected");
        assert_eq!(
            failure_reason(JoyLinkError::Serial("busy".into())),
            "Serial port error: busy"
        );
    }

    #[test]
    fn test_connect_outside_runtime_reports_error() {
        let adapter = FakeAdapter::new();
        let link = link_with(&adapter);
        let mut stream = link.connect(&hc06());
        let event = tokio_test::block_on(stream.next());
        assert!(matches!(event, Some(ConnectionResult::Error(_))));
    }
}
