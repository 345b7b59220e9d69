//! Thread-safe FIFO queue of work items with save/restore support.
//!
//! # Design
//!
//! - **Strict FIFO**: insertion order is dequeue order, no priorities
//! - **No polling**: dequeuers block on a `Condvar` while the queue is empty or paused
//! - **In-flight accounting**: a dequeue marks one item in flight under the same lock that
//!   removed it, so "queue empty and nothing in flight" is observed atomically
//! - **Save/restore**: `save` parks the current contents on a stack, `restore` brings
//!   them back ahead of anything queued in the meantime

use std::collections::VecDeque;
use std::mem;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use super::work_item::WorkItem;
use super::DispatchError;

/// Lifecycle state of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemQueueState {
    /// Items are accepted but not handed out.
    Paused,
    /// Items are accepted and handed out.
    Running,
    /// Nothing is handed out any more; enqueue is refused.
    Stopped,
}

struct QueueInner {
    active: VecDeque<Arc<WorkItem>>,
    saved: Vec<VecDeque<Arc<WorkItem>>>,
    state: WorkItemQueueState,
    in_flight: usize,
}

/// FIFO queue feeding one family of workers.
pub struct WorkItemQueue {
    name: String,
    inner: Mutex<QueueInner>,
    available: Condvar,
}

impl WorkItemQueue {
    /// Create an empty, paused queue.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(QueueInner {
                active: VecDeque::new(),
                saved: Vec::new(),
                state: WorkItemQueueState::Paused,
                in_flight: 0,
            }),
            available: Condvar::new(),
        }
    }

    /// Queue name, used in logs.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> WorkItemQueueState {
        self.inner.lock().state
    }

    /// Append an item to the tail and wake one waiting dequeuer.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::IllegalState` if the queue has been stopped.
    pub fn enqueue(&self, item: Arc<WorkItem>) -> Result<(), DispatchError> {
        let mut inner = self.inner.lock();
        if inner.state == WorkItemQueueState::Stopped {
            return Err(DispatchError::IllegalState(format!(
                "queue `{}` is stopped",
                self.name
            )));
        }
        inner.active.push_back(item);
        drop(inner);
        self.available.notify_one();
        Ok(())
    }

    /// Blocking pop from the head.
    ///
    /// Waits while the queue is empty or paused. Returns `None` once the queue is
    /// stopped. A returned item counts as in flight until [`WorkItemQueue::release`].
    pub fn dequeue(&self) -> Option<Arc<WorkItem>> {
        let mut inner = self.inner.lock();
        loop {
            match inner.state {
                WorkItemQueueState::Stopped => return None,
                WorkItemQueueState::Running => {
                    if let Some(item) = inner.active.pop_front() {
                        inner.in_flight += 1;
                        return Some(item);
                    }
                }
                WorkItemQueueState::Paused => {}
            }
            self.available.wait(&mut inner);
        }
    }

    /// Mark one dequeued item as no longer in flight.
    pub fn release(&self) {
        let mut inner = self.inner.lock();
        inner.in_flight = inner.in_flight.saturating_sub(1);
    }

    /// Let dequeuers take items.
    pub fn start(&self) {
        self.set_state(WorkItemQueueState::Running);
    }

    /// Keep items but stop handing them out.
    pub fn pause(&self) {
        self.set_state(WorkItemQueueState::Paused);
    }

    /// Stop for good and release every blocked dequeuer. Idempotent.
    pub fn stop(&self) {
        self.set_state(WorkItemQueueState::Stopped);
    }

    fn set_state(&self, state: WorkItemQueueState) {
        let mut inner = self.inner.lock();
        if inner.state == WorkItemQueueState::Stopped || inner.state == state {
            return;
        }
        tracing::trace!(queue = %self.name, from = ?inner.state, to = ?state, "queue state change");
        inner.state = state;
        drop(inner);
        self.available.notify_all();
    }

    /// Park the current contents and continue with an empty queue.
    pub fn save(&self) {
        let mut inner = self.inner.lock();
        let current = mem::take(&mut inner.active);
        inner.saved.push(current);
        tracing::trace!(queue = %self.name, depth = inner.saved.len(), "queue saved");
    }

    /// Bring back the most recently saved contents.
    ///
    /// Items enqueued since the matching `save` that are still waiting stay queued, behind
    /// the restored ones. Without a saved level this is a no-op.
    pub fn restore(&self) {
        let mut inner = self.inner.lock();
        let Some(mut restored) = inner.saved.pop() else {
            tracing::warn!(queue = %self.name, "restore without a saved level ignored");
            return;
        };
        restored.append(&mut inner.active);
        inner.active = restored;
        let running = inner.state == WorkItemQueueState::Running;
        tracing::trace!(queue = %self.name, depth = inner.saved.len(), "queue restored");
        drop(inner);
        if running {
            self.available.notify_all();
        }
    }

    /// Remove every waiting item, saved levels included. Used when a run is torn down.
    pub fn drain(&self) -> Vec<Arc<WorkItem>> {
        let mut inner = self.inner.lock();
        let saved = mem::take(&mut inner.saved);
        let mut drained: Vec<_> = saved.into_iter().flatten().collect();
        drained.extend(inner.active.drain(..));
        drained
    }

    /// Number of items waiting in the active level.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().active.len()
    }

    /// True when the active level holds no items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().active.is_empty()
    }

    /// Number of handed-out items not yet released.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.lock().in_flight
    }

    /// Number of saved levels.
    #[must_use]
    pub fn saved_depth(&self) -> usize {
        self.inner.lock().saved.len()
    }

    /// True while items wait to be handed out or a handed-out item is still in flight.
    ///
    /// Waiting items of a stopped queue do not count: they will never be handed out.
    #[must_use]
    pub fn has_work(&self) -> bool {
        let inner = self.inner.lock();
        inner.in_flight > 0
            || (inner.state != WorkItemQueueState::Stopped && !inner.active.is_empty())
    }
}

impl std::fmt::Debug for WorkItemQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("WorkItemQueue")
            .field("name", &self.name)
            .field("state", &inner.state)
            .field("len", &inner.active.len())
            .field("saved", &inner.saved.len())
            .field("in_flight", &inner.in_flight)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn item(name: &str) -> Arc<WorkItem> {
        WorkItem::leaf(name, |_| Ok(())).build()
    }

    fn names(items: &[Arc<WorkItem>]) -> Vec<String> {
        items.iter().map(|i| i.name().to_string()).collect()
    }

    #[test]
    fn test_fifo_order() {
        let q = WorkItemQueue::new("fifo");
        q.start();
        q.enqueue(item("a")).unwrap();
        q.enqueue(item("b")).unwrap();
        q.enqueue(item("c")).unwrap();

        assert_eq!(q.dequeue().unwrap().name(), "a");
        assert_eq!(q.dequeue().unwrap().name(), "b");
        assert_eq!(q.dequeue().unwrap().name(), "c");
        assert!(q.is_empty());
    }

    #[test]
    fn test_enqueue_after_stop_fails() {
        let q = WorkItemQueue::new("stopped");
        q.stop();
        let err = q.enqueue(item("late")).unwrap_err();
        assert!(matches!(err, DispatchError::IllegalState(_)));
        assert_eq!(q.state(), WorkItemQueueState::Stopped);
    }

    #[test]
    fn test_stop_is_final_and_idempotent() {
        let q = WorkItemQueue::new("final");
        q.stop();
        q.stop();
        q.start();
        assert_eq!(q.state(), WorkItemQueueState::Stopped);
        assert!(q.dequeue().is_none());
    }

    #[test]
    fn test_stop_releases_blocked_dequeuer() {
        let q = Arc::new(WorkItemQueue::new("blocking"));
        q.start();
        let waiter = Arc::clone(&q);
        let handle = thread::spawn(move || waiter.dequeue().is_none());

        thread::sleep(Duration::from_millis(50));
        q.stop();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn test_paused_queue_holds_items_until_started() {
        let q = Arc::new(WorkItemQueue::new("paused"));
        q.enqueue(item("held")).unwrap();

        let waiter = Arc::clone(&q);
        let handle = thread::spawn(move || waiter.dequeue().map(|i| i.name().to_string()));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(q.len(), 1);

        q.start();
        assert_eq!(handle.join().unwrap().as_deref(), Some("held"));
    }

    #[test]
    fn test_in_flight_tracking() {
        let q = WorkItemQueue::new("tracked");
        q.start();
        q.enqueue(item("x")).unwrap();
        assert!(q.has_work());

        let _x = q.dequeue().unwrap();
        assert!(q.is_empty());
        assert!(q.has_work());

        q.release();
        assert!(!q.has_work());
    }

    #[test]
    fn test_stopped_queue_has_no_pending_work() {
        let q = WorkItemQueue::new("leftovers");
        q.enqueue(item("never")).unwrap();
        assert!(q.has_work());
        q.stop();
        assert!(!q.has_work());
        assert_eq!(names(&q.drain()), vec!["never"]);
    }

    #[test]
    fn test_save_and_restore_keep_order() {
        let q = WorkItemQueue::new("nested");
        q.start();
        q.enqueue(item("outer-1")).unwrap();
        q.enqueue(item("outer-2")).unwrap();

        q.save();
        assert!(q.is_empty());
        assert_eq!(q.saved_depth(), 1);
        q.enqueue(item("inner")).unwrap();

        q.save();
        assert_eq!(q.saved_depth(), 2);
        q.enqueue(item("innermost")).unwrap();
        assert_eq!(q.dequeue().unwrap().name(), "innermost");
        q.release();

        q.restore();
        assert_eq!(q.saved_depth(), 1);
        assert_eq!(q.dequeue().unwrap().name(), "inner");
        q.release();

        q.restore();
        assert_eq!(q.saved_depth(), 0);
        assert_eq!(names(&q.drain()), vec!["outer-1", "outer-2"]);
    }

    #[test]
    fn test_restore_puts_saved_items_ahead_of_new_ones() {
        let q = WorkItemQueue::new("merge");
        q.enqueue(item("saved")).unwrap();
        q.save();
        q.enqueue(item("added")).unwrap();
        q.restore();
        assert_eq!(names(&q.drain()), vec!["saved", "added"]);
    }

    #[test]
    fn test_restore_without_save_is_noop() {
        let q = WorkItemQueue::new("noop");
        q.enqueue(item("only")).unwrap();
        q.restore();
        assert_eq!(q.len(), 1);
        assert_eq!(q.saved_depth(), 0);
    }

    #[test]
    fn test_drain_includes_saved_levels() {
        let q = WorkItemQueue::new("drain");
        q.enqueue(item("level-0")).unwrap();
        q.save();
        q.enqueue(item("level-1")).unwrap();
        let drained = q.drain();
        assert_eq!(names(&drained), vec!["level-0", "level-1"]);
        assert_eq!(q.saved_depth(), 0);
        assert!(q.is_empty());
    }

    #[test]
    fn test_concurrent_dequeuers_each_item_once() {
        let q = Arc::new(WorkItemQueue::new("shared"));
        for i in 0..200 {
            q.enqueue(item(&format!("item-{i}"))).unwrap();
        }
        q.start();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let q = Arc::clone(&q);
                thread::spawn(move || {
                    let mut seen = Vec::new();
                    while let Some(item) = q.dequeue() {
                        seen.push(item.name().to_string());
                        q.release();
                        if q.is_empty() {
                            break;
                        }
                    }
                    seen
                })
            })
            .collect();

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.join().unwrap());
        }
        // Threads that saw an empty queue exit; anything left is drained here.
        q.stop();
        all.extend(names(&q.drain()));
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 200);
    }
}
