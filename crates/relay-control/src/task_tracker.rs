//! Per-backend background tasks
//!
//! Holds the grace-period timer of every backend in `reconnecting` state so
//! a resume (or a newer disconnect) can abort the stale timer.

use std::collections::HashMap;
use std::sync::Mutex;
use tokio::task::JoinHandle;

pub struct TaskTracker {
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Register a task for a backend, aborting any previous one
    pub fn register(&self, backend_id: String, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old_handle) = tasks.insert(backend_id, handle) {
            old_handle.abort();
        }
    }

    /// Abort and forget the task for a backend
    pub fn cancel(&self, backend_id: &str) -> bool {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        match tasks.remove(backend_id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Forget a task that finished on its own, without aborting it
    pub fn forget(&self, backend_id: &str) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.remove(backend_id);
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TaskTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TaskTracker {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut().unwrap_or_else(|e| e.into_inner());
        for (_, handle) in tasks.drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_register_and_cancel() {
        let tracker = TaskTracker::new();
        let handle = tokio::spawn(async { tokio::time::sleep(Duration::from_secs(10)).await });

        tracker.register("ws-1".to_string(), handle);
        assert_eq!(tracker.len(), 1);

        assert!(tracker.cancel("ws-1"));
        assert!(tracker.is_empty());
        assert!(!tracker.cancel("ws-1"));
    }

    #[tokio::test]
    async fn test_replacing_task_aborts_old() {
        let tracker = TaskTracker::new();

        let handle1 = tokio::spawn(async { tokio::time::sleep(Duration::from_secs(10)).await });
        let abort1 = handle1.abort_handle();
        tracker.register("ws-1".to_string(), handle1);

        let handle2 = tokio::spawn(async { tokio::time::sleep(Duration::from_secs(10)).await });
        tracker.register("ws-1".to_string(), handle2);

        tokio::task::yield_now().await;
        assert!(abort1.is_finished());
        assert_eq!(tracker.len(), 1);
    }
}
