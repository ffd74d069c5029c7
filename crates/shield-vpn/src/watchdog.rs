//! Progress watchdog for detecting stuck connection attempts.

use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Fires when no progress was recorded for `deadline`.
///
/// Progress timestamps use the tokio clock, so paused-time tests drive it.
pub struct ProgressWatchdog {
    deadline: Duration,
    last_progress: watch::Sender<Instant>,
}

impl ProgressWatchdog {
    /// Start watching; creation counts as progress
    pub fn new(deadline: Duration) -> Self {
        let (last_progress, _) = watch::channel(Instant::now());
        Self {
            deadline,
            last_progress,
        }
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Record progress, pushing the deadline out
    pub fn record(&self, what: &str) {
        debug!("Progress: {}", what);
        self.last_progress.send_replace(Instant::now());
    }

    /// Time since the last recorded progress
    pub fn idle_for(&self) -> Duration {
        self.last_progress.borrow().elapsed()
    }

    /// Resolves once the deadline passes without progress
    pub async fn expired(&self) {
        let mut rx = self.last_progress.subscribe();
        loop {
            let deadline = *rx.borrow_and_update() + self.deadline;
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    if !rx.has_changed().unwrap_or(false) {
                        warn!("No progress for {:?}", self.deadline);
                        return;
                    }
                }
                _ = rx.changed() => {}
            }
        }
    }
}
