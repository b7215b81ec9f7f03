//! Power event notifier chain
//!
//! Plain observer table: callbacks run synchronously, in registration order,
//! on the notifying thread. The table lock is released before any callback
//! runs, so a callback may register or unregister observers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// Events the governor reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerEvent {
    DisplayBlank,
    DisplayUnblank,
    SuspendPrepare,
    PostResume,
    Reboot,
}

impl fmt::Display for PowerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::DisplayBlank => "display_blank",
            Self::DisplayUnblank => "display_unblank",
            Self::SuspendPrepare => "suspend_prepare",
            Self::PostResume => "post_resume",
            Self::Reboot => "reboot",
        };
        f.write_str(name)
    }
}

/// Handle returned by [`NotifierChain::register`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NotifierId(u64);

type Callback = Arc<dyn Fn(PowerEvent) + Send + Sync>;

/// Ordered callback table
#[derive(Default)]
pub struct NotifierChain {
    callbacks: RwLock<Vec<(NotifierId, Callback)>>,
    next_id: AtomicU64,
}

impl NotifierChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, callback: F) -> NotifierId
    where
        F: Fn(PowerEvent) + Send + Sync + 'static,
    {
        let id = NotifierId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.callbacks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(callback)));
        id
    }

    pub fn unregister(&self, id: NotifierId) -> bool {
        let mut callbacks = self.callbacks.write().unwrap_or_else(PoisonError::into_inner);
        let before = callbacks.len();
        callbacks.retain(|(i, _)| *i != id);
        callbacks.len() != before
    }

    pub fn len(&self) -> usize {
        self.callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dispatch `event` to every registered callback
    pub fn notify(&self, event: PowerEvent) {
        let callbacks: Vec<Callback> = self
            .callbacks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        debug!("Dispatching {} to {} listeners", event, callbacks.len());
        for callback in callbacks {
            callback(event);
        }
    }
}
