use std::sync::atomic::{AtomicUsize, Ordering};

use super::{Event, Middleware, WorkerHandle};

/// Signals `RestartPending` once `limit` messages have been processed.
///
/// The counter is in-memory only and resets to zero at process start: a
/// relaunched (post-restart) process always starts counting fresh.
pub struct MaxTasksPerChild {
    limit: usize,
    processed: AtomicUsize,
}

impl MaxTasksPerChild {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            processed: AtomicUsize::new(0),
        }
    }
}

impl Middleware for MaxTasksPerChild {
    fn on_event(&self, worker: &WorkerHandle, event: &Event<'_>) {
        if self.limit == 0 {
            return;
        }
        if let Event::AfterProcess(_, _) = event {
            let count = self.processed.fetch_add(1, Ordering::SeqCst) + 1;
            if count >= self.limit {
                worker.request_restart();
            }
        }
    }
}
