//! Process-wide shutdown latch shared by every task.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// One-shot, broadcast cancellation flag.
///
/// The flag starts armed and can be triggered exactly once; triggering it
/// again is a no-op. Every clone observes the same flag, and waiting for it
/// never consumes it.
#[derive(Debug, Clone)]
pub struct CancellationSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancellationSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Trigger the signal. Returns `true` only for the call that flipped it.
    pub fn trigger(&self) -> bool {
        self.tx.send_if_modified(|triggered| {
            if *triggered {
                false
            } else {
                *triggered = true;
                true
            }
        })
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once the signal has been triggered (immediately if it already was).
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this cannot observe a closed channel.
        let _ = rx.wait_for(|triggered| *triggered).await;
    }

    /// Sleep for `duration` unless the signal fires first.
    ///
    /// Returns `true` when the sleep was cut short by cancellation.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancelled() => true,
            _ = tokio::time::sleep(duration) => false,
        }
    }
}
