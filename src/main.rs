//! # JoyLink
//!
//! Stream joystick positions from stdin to a Bluetooth serial device.
//!
//! Each stdin line is an `x,y` offset. Positions are clamped to the
//! configured deflection, coalesced to the configured send rate and written
//! to the device as `x,y\n`. Lines the device sends back are logged.

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, info, warn};

use joylink::config::Config;
use joylink::device::Device;
use joylink::joystick::{JoystickPosition, PositionCoalescer};
use joylink::link::{LinkController, LinkSettings};
use joylink::logging::init_logging;
use joylink::platform::serial_port::SerialPortAdapter;
use joylink::ui_state::{UiState, UiStateWatch};

/// Number of positions between status log messages
const LOG_INTERVAL_SENDS: u64 = 500;

/// Main entry point for JoyLink
///
/// # Control Flow
///
/// 1. **Initialization**
///    - Load configuration (defaults when no path is given)
///    - Set up logging
///    - Discover devices until the configured one shows up or the scan
///      window closes
///
/// 2. **Connect**
///    - Connect to the configured device, or the first paired or
///      discovered one
///
/// 3. **Main Loop**
///    - Read `x,y` lines from stdin
///    - Send the newest position once per tick
///    - Log lines received from the device
///
/// 4. **Graceful Shutdown** on Ctrl+C, stdin EOF or link failure
///    - Send a centered position when possible
///    - Disconnect and stop discovery
///
/// # Errors
///
/// Returns error if:
/// - The configuration file cannot be read or is invalid
/// - No device could be found
/// - The connection attempt fails
///
/// # Examples
///
/// ```bash
/// printf '0,0\n120,-40\n0,0\n' | cargo run --release -- config/joylink.toml
/// ```
#[tokio::main]
async fn main() -> Result<()> {
    let config = match std::env::args_os().nth(1).map(PathBuf::from) {
        Some(path) => Config::load(&path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config::default(),
    };

    let _logging = init_logging(&config.logging);
    info!("JoyLink v{} starting...", env!("CARGO_PKG_VERSION"));

    let adapter = Arc::new(SerialPortAdapter::from_config(&config));
    let controller = LinkController::new(adapter, LinkSettings::from_config(&config.link));
    let mut view = controller.subscribe();

    let Some(device) = discover(&controller, &mut view, &config).await? else {
        info!("Interrupted during discovery");
        return Ok(());
    };

    controller.connect(device.clone());
    if !wait_for_connection(&mut view).await? {
        controller.disconnect();
        return Ok(());
    }
    info!("Connected to {}", device);

    let result = run(&controller, &mut view, &config).await;

    controller.disconnect();
    controller.stop_discovery();
    info!("Shutdown complete");
    result
}

/// Scan for devices and pick the one to connect to
///
/// Returns `None` when interrupted by Ctrl+C.
async fn discover(
    controller: &LinkController,
    view: &mut UiStateWatch,
    config: &Config,
) -> Result<Option<Device>> {
    let target = config.link.target_device();
    let known = |address: &str| controller.find_device(address);

    if let Some(address) = target {
        if let Some(device) = known(address) {
            info!("Using paired device {}", device);
            return Ok(Some(device));
        }
    }

    if controller.start_discovery() {
        info!(
            "Scanning for devices for up to {}s",
            config.discovery.scan_duration_s
        );
        let deadline = sleep(config.discovery.scan_duration());
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => break,
                _ = tokio::signal::ctrl_c() => {
                    controller.stop_discovery();
                    return Ok(None);
                }
                state = view.changed() => {
                    let Some(state) = state else { break };
                    log_state(&state);
                    if !state.is_discover_started {
                        break;
                    }
                    if target.is_some_and(|address| state.scanned_devices.contains(address)) {
                        break;
                    }
                }
            }
        }
        controller.stop_discovery();
    }

    let state = controller.ui_state();
    for device in state.paired_devices.iter().chain(state.scanned_devices.iter()) {
        info!("Available: {}", device);
    }

    Ok(Some(controller.choose_device(target)?))
}

/// Wait for the pending connection to settle
///
/// Returns `false` when interrupted by Ctrl+C.
async fn wait_for_connection(view: &mut UiStateWatch) -> Result<bool> {
    let mut state = view.current();
    loop {
        if state.is_connected {
            return Ok(true);
        }
        if !state.is_connecting {
            let reason = state.error_message.unwrap_or_else(|| "unknown error".to_string());
            bail!("Connection failed: {}", reason);
        }

        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(false),
            next = view.changed() => match next {
                Some(next) => state = next,
                None => bail!("Link controller went away"),
            },
        }
    }
}

/// Stream stdin positions to the device until shutdown
async fn run(controller: &LinkController, view: &mut UiStateWatch, config: &Config) -> Result<()> {
    let max = config.joystick.max_deflection;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut coalescer = PositionCoalescer::new();
    let mut ticker = interval(config.joystick.send_period());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(
        "Streaming joystick positions at {}Hz (max deflection {})",
        config.joystick.send_rate_hz, max
    );
    info!("Press Ctrl+C to exit");

    let mut send_count: u64 = 0;
    let mut last_log_count: u64 = 0;
    let mut seen_messages = 0;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
                break;
            }

            line = lines.next_line() => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => match line.parse::<JoystickPosition>() {
                    Ok(position) => coalescer.update(position.clamped(max)),
                    Err(e) => warn!("Ignoring input: {}", e),
                },
                Ok(None) => {
                    info!("Input closed, shutting down...");
                    break;
                }
                Err(e) => {
                    warn!("Failed to read input: {}", e);
                    break;
                }
            },

            _ = ticker.tick() => {
                let Some(position) = coalescer.take_due() else { continue };
                if controller.send(&position.to_message()) {
                    coalescer.mark_sent(position);
                    send_count += 1;
                } else {
                    coalescer.retry(position);
                }

                if send_count - last_log_count >= LOG_INTERVAL_SENDS {
                    info!("Sent {} positions (last {})", send_count, position);
                    last_log_count = send_count;
                }
            }

            state = view.changed() => {
                let Some(state) = state else { break };
                log_state(&state);

                if state.messages.len() < seen_messages {
                    seen_messages = 0;
                }
                for message in &state.messages[seen_messages..] {
                    info!("Received: {}", message);
                }
                seen_messages = state.messages.len();

                if !state.is_connected && !state.is_connecting {
                    bail!(
                        "Link lost: {}",
                        state.error_message.as_deref().unwrap_or("disconnected")
                    );
                }
            }
        }
    }

    if controller.send(&JoystickPosition::CENTER.to_message()) {
        debug!("Sent centered position");
        // Give the writer a tick to flush before the link is torn down
        sleep(config.joystick.send_period()).await;
    }
    info!("Total positions sent: {}", send_count);
    Ok(())
}

fn log_state(state: &UiState) {
    match serde_json::to_string(state) {
        Ok(json) => debug!("UI state: {}", json),
        Err(e) => debug!("UI state not serializable: {}", e),
    }
}
