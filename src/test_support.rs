//! Shared helpers for async unit tests.

use std::time::Duration;

/// Poll `condition` until it holds, failing the test after two seconds.
pub async fn wait_until<F: FnMut() -> bool>(what: &str, mut condition: F) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// Give spawned tasks a chance to run (and misbehave) before asserting.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
