//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use prometheus_work_dispatch::config::DispatcherConfig;
use prometheus_work_dispatch::core::{DispatcherEvent, ParallelDispatcher, WorkItem, WorkItemBuilder};

pub const RUN_TIMEOUT: Duration = Duration::from_secs(20);

// ============================================================================
// DISPATCHERS
// ============================================================================

pub fn config(workers: usize) -> DispatcherConfig {
    prometheus_work_dispatch::util::init_tracing();
    DispatcherConfig::new()
        .with_parallel_workers(workers)
        .with_thread_name_prefix("it")
        .with_thread_stack_size(1024 * 1024)
        .with_forced_cancel_timeout_ms(500)
        .with_shutdown_join_timeout_ms(1_000)
}

pub fn parallel(workers: usize) -> ParallelDispatcher {
    ParallelDispatcher::new(config(workers)).expect("valid config")
}

// ============================================================================
// RECORDING
// ============================================================================

/// What a recorded body observed while running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mark {
    Start(String),
    End(String),
}

/// Ordered log of body start/end marks, plus a live concurrency gauge.
#[derive(Default)]
pub struct Recorder {
    marks: Mutex<Vec<Mark>>,
    threads: Mutex<Vec<(String, ThreadId, Option<String>)>>,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn enter(&self, name: &str) {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
        let current = thread::current();
        self.threads.lock().push((
            name.to_string(),
            current.id(),
            current.name().map(str::to_owned),
        ));
        self.marks.lock().push(Mark::Start(name.to_string()));
    }

    pub fn exit(&self, name: &str) {
        self.marks.lock().push(Mark::End(name.to_string()));
        self.running.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn marks(&self) -> Vec<Mark> {
        self.marks.lock().clone()
    }

    pub fn started(&self) -> Vec<String> {
        self.marks()
            .into_iter()
            .filter_map(|m| match m {
                Mark::Start(name) => Some(name),
                Mark::End(_) => None,
            })
            .collect()
    }

    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    pub fn thread_of(&self, name: &str) -> Option<ThreadId> {
        self.threads
            .lock()
            .iter()
            .find(|(n, _, _)| n == name)
            .map(|(_, id, _)| *id)
    }

    pub fn thread_name_of(&self, name: &str) -> Option<String> {
        self.threads
            .lock()
            .iter()
            .find(|(n, _, _)| n == name)
            .and_then(|(_, _, thread)| thread.clone())
    }

    pub fn position(&self, mark: &Mark) -> Option<usize> {
        self.marks().iter().position(|m| m == mark)
    }
}

/// Leaf whose body records start/end and sleeps for `work`.
pub fn recorded_leaf(recorder: &Arc<Recorder>, name: &str, work: Duration) -> WorkItemBuilder {
    let recorder = Arc::clone(recorder);
    let label = name.to_string();
    WorkItem::leaf(name, move |_ctx| {
        recorder.enter(&label);
        thread::sleep(work);
        recorder.exit(&label);
        Ok(())
    })
}

/// Leaf that blocks until `gate` is closed or `max` elapses.
pub fn gated_leaf(name: &str, gate: Receiver<()>, max: Duration) -> WorkItemBuilder {
    WorkItem::leaf(name, move |_ctx| {
        let _ = gate.recv_timeout(max);
        Ok(())
    })
}

// ============================================================================
// EVENTS
// ============================================================================

pub fn drain_events(rx: &Receiver<DispatcherEvent>) -> Vec<DispatcherEvent> {
    rx.try_iter().collect()
}

pub fn gate() -> (Sender<()>, Receiver<()>) {
    crossbeam_channel::unbounded()
}

/// Poll `done` until it holds or `timeout` elapses.
pub fn eventually(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    done()
}
