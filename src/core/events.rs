//! Dispatcher notifications.
//!
//! Events are informational only: nothing in the scheduler waits on a subscriber, and a
//! subscriber that drops its receiver is silently forgotten.

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::Serialize;

use super::dispatcher::RunOutcome;
use super::shift::ShiftKind;

/// Lifecycle notification emitted by a dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DispatcherEvent {
    /// A shift is about to start handing out work.
    ShiftStarting {
        /// Shift being started.
        shift: ShiftKind,
    },
    /// A shift ran out of work and all of its workers are idle.
    ShiftFinished {
        /// Shift that finished.
        shift: ShiftKind,
    },
    /// A composite isolated the queues for its own subtree.
    IsolationEntered {
        /// Name of the isolating composite.
        item: String,
        /// Nesting depth after entering.
        depth: usize,
    },
    /// An isolated composite finished and the surrounding queues were restored.
    IsolationExited {
        /// Name of the composite whose isolation ended.
        item: String,
        /// Nesting depth after leaving.
        depth: usize,
    },
    /// The run is over.
    RunFinished {
        /// How the run ended.
        outcome: RunOutcome,
    },
}

/// Fan-out of events to any number of subscribers.
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<DispatcherEvent>>>,
}

impl EventBus {
    /// Create a bus with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber. Only events emitted after this call are delivered.
    pub fn subscribe(&self) -> Receiver<DispatcherEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Deliver `event` to every live subscriber.
    pub fn emit(&self, event: &DispatcherEvent) {
        tracing::trace!(?event, "dispatcher event");
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}
