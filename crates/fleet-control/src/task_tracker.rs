//! Keyed background tasks
//!
//! At most one task per key; registering a new one aborts the previous task.
//! Used for per-agent ack watchdogs.

use std::collections::HashMap;
use std::sync::Mutex;
use tokio::task::JoinHandle;

#[derive(Default)]
pub struct TaskTracker {
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, key: impl Into<String>, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.retain(|_, h| !h.is_finished());
        if let Some(old) = tasks.insert(key.into(), handle) {
            old.abort();
        }
    }

    /// Abort the task for `key`; returns whether one was running
    pub fn cancel(&self, key: &str) -> bool {
        let handle = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        match handle {
            Some(handle) => {
                let running = !handle.is_finished();
                handle.abort();
                running
            }
            None => false,
        }
    }

    pub fn is_tracked(&self, key: &str) -> bool {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    pub fn cancel_all(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        for (_, handle) in tasks.drain() {
            handle.abort();
        }
    }
}

impl Drop for TaskTracker {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
