//! A fixed set of event variants and a list of listeners polymorphic over a
//! narrow [`WorkerHandle`] capability, rather than the dynamic, name-keyed
//! hook dispatch found in some task-queue frameworks.

mod max_tasks_per_child;
mod restart_on_request;

pub use max_tasks_per_child::MaxTasksPerChild;
pub use restart_on_request::RestartOnRequest;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::message::Message;

/// What happened to a message after the user function ran.
///
/// Modeled as an explicit result variant rather than routing
/// `RestartRequested` as a thrown exception.
#[derive(Debug)]
pub enum Outcome {
    Success,
    Retryable(Box<dyn std::error::Error + Send + Sync>),
    Terminal(Box<dyn std::error::Error + Send + Sync>),
    RestartRequested,
}

/// The fixed set of lifecycle events a [`Middleware`] can observe.
pub enum Event<'a> {
    BeforeProcess(&'a Message),
    AfterProcess(&'a Message, &'a Outcome),
    BeforeConsumerStop,
}

/// Narrow capability handed to middlewares: enough to request a restart,
/// nothing that would let a middleware reach into worker internals.
#[derive(Clone)]
pub struct WorkerHandle {
    restart_requested: Arc<AtomicBool>,
}

impl WorkerHandle {
    pub(crate) fn new(restart_requested: Arc<AtomicBool>) -> Self {
        Self { restart_requested }
    }

    /// Signals `RestartPending`. Exactly one transition takes effect per
    /// process lifetime; subsequent calls are idempotent no-ops.
    pub fn request_restart(&self) {
        let _ = self
            .restart_requested
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst);
    }

    pub fn restart_requested(&self) -> bool {
        self.restart_requested.load(Ordering::SeqCst)
    }
}

/// A listener reacting to worker lifecycle events.
pub trait Middleware: Send + Sync {
    fn on_event(&self, worker: &WorkerHandle, event: &Event<'_>);
}
