//! Cancellable poll timer
//!
//! One abstraction for both scheduling variants. `Periodic` always waits the
//! configured poll interval. `Deferrable` stretches the wait to the
//! down-sample interval while the system is fully populated and steady, and
//! relies on [`PollTimer::kick`] to wake the loop early when something changes.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::{watch, Notify};

/// Floor on any wait, so a zero delay cannot spin the worker
const MIN_WAIT: Duration = Duration::from_millis(1);

/// Timer arm mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArmMode {
    #[default]
    Periodic,
    Deferrable,
}

/// Why a wait returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Elapsed,
    Kicked,
    Cancelled,
}

/// Interruptible timer shared between a task and its controller
#[derive(Debug)]
pub struct PollTimer {
    mode: ArmMode,
    down_sample: Duration,
    kick: Notify,
    cancel: watch::Sender<bool>,
}

impl PollTimer {
    pub fn new(mode: ArmMode, down_sample: Duration) -> Self {
        Self {
            mode,
            down_sample,
            kick: Notify::new(),
            cancel: watch::Sender::new(false),
        }
    }

    pub fn mode(&self) -> ArmMode {
        self.mode
    }

    /// Interval until the next tick
    pub fn next_interval(&self, poll: Duration, steady: bool) -> Duration {
        let interval = match self.mode {
            ArmMode::Deferrable if steady => self.down_sample.max(poll),
            _ => poll,
        };
        interval.max(MIN_WAIT)
    }

    /// Wait until `timeout` elapses, a kick arrives, or the timer is cancelled
    pub async fn wait(&self, timeout: Duration) -> WaitOutcome {
        let mut cancelled = self.cancel.subscribe();
        tokio::select! {
            biased;
            _ = async {
                let _ = cancelled.wait_for(|&c| c).await;
            } => WaitOutcome::Cancelled,
            _ = self.kick.notified() => WaitOutcome::Kicked,
            _ = tokio::time::sleep(timeout) => WaitOutcome::Elapsed,
        }
    }

    /// Wake the waiter now, or on its next wait if it is busy
    pub fn kick(&self) {
        self.kick.notify_one();
    }

    /// Stop the waiter; every later wait returns immediately until rearmed
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub fn rearm(&self) {
        self.cancel.send_replace(false);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }
}
