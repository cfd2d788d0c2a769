//! Pause and cancellation of a running script.

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use hauler_core::EngineError;

/// Pause/cancel handle shared by a script task and whoever drives it.
#[derive(Debug, Clone)]
pub struct JobControl {
    paused_tx: watch::Sender<bool>,
    paused_rx: watch::Receiver<bool>,
    cancel: CancellationToken,
}

impl JobControl {
    /// Create a running (not paused) control.
    pub fn new() -> Self {
        Self::with_paused(false)
    }

    /// Create a control that starts paused.
    pub fn with_paused(paused: bool) -> Self {
        let (paused_tx, paused_rx) = watch::channel(paused);
        Self {
            paused_tx,
            paused_rx,
            cancel: CancellationToken::new(),
        }
    }

    pub fn pause(&self) {
        self.paused_tx.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused_tx.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.paused_rx.borrow()
    }

    /// Request cancellation; a paused job wakes up to observe it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token that fires on cancellation.
    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Wait until not paused, then fail if cancelled.
    pub async fn checkpoint(&self) -> Result<(), EngineError> {
        let mut rx = self.paused_rx.clone();
        tokio::select! {
            _ = self.cancel.cancelled() => return Err(EngineError::Cancelled),
            res = rx.wait_for(|paused| !*paused) => {
                // Sender dropped while paused: nobody can resume us.
                if res.is_err() {
                    return Err(EngineError::Cancelled);
                }
            }
        }
        if self.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        Ok(())
    }
}

impl Default for JobControl {
    fn default() -> Self {
        Self::new()
    }
}
