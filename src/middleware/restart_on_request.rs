use super::{Event, Middleware, Outcome, WorkerHandle};

/// Signals `RestartPending` when a task's [`Outcome::RestartRequested`]
/// bubbles through `AfterProcess`. User task code raises this to ask the
/// process to recycle itself, e.g. after a memory-bloating operation.
pub struct RestartOnRequest;

impl Middleware for RestartOnRequest {
    fn on_event(&self, worker: &WorkerHandle, event: &Event<'_>) {
        if let Event::AfterProcess(_, Outcome::RestartRequested) = event {
            worker.request_restart();
        }
    }
}
