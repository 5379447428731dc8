use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::broker::BrokerClient;
use crate::consumer::Consumer;
use crate::message::Message;
use crate::middleware::{Event, Middleware, Outcome, WorkerHandle};

/// `Running -> RestartPending -> Draining -> Exit(code)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum WorkerState {
    Running,
    RestartPending,
    Draining,
}

/// Clean-shutdown exit code.
pub const EXIT_CLEAN: i32 = 0;
/// Sentinel an external supervisor should interpret as "relaunch me".
pub const EXIT_RESTART_REQUESTED: i32 = 3;

/// What to do with a message whose task raised a retryable error.
///
/// The retry policy itself is deliberately external to this crate; this is
/// the seam a concrete policy plugs into. The default leaves the message
/// un-acked so maintenance eventually redelivers it.
pub enum RetryDecision {
    Ack,
    LeaveInFlight,
}

pub trait RetryPolicy: Send + Sync {
    fn handle_retryable(
        &self,
        message: &Message,
        error: &(dyn std::error::Error + Send + Sync),
    ) -> RetryDecision;
}

pub struct NoopRetryPolicy;

impl RetryPolicy for NoopRetryPolicy {
    fn handle_retryable(
        &self,
        _message: &Message,
        _error: &(dyn std::error::Error + Send + Sync),
    ) -> RetryDecision {
        RetryDecision::LeaveInFlight
    }
}

type BoxOutcomeFuture = Pin<Box<dyn Future<Output = Outcome> + Send>>;
type TaskFn = Arc<dyn Fn(Message) -> BoxOutcomeFuture + Send + Sync>;

/// Builds a [`Worker`]: executor pool size, subscribed queues (each becomes
/// a [`Consumer`]), the middleware chain, and the retry policy.
pub struct WorkerBuilder {
    broker: BrokerClient,
    executors: usize,
    prefetch: usize,
    queues: Vec<String>,
    middlewares: Vec<Arc<dyn Middleware>>,
    retry_policy: Arc<dyn RetryPolicy>,
    ack_on_restart_request: bool,
    shutdown_grace: Duration,
}

impl WorkerBuilder {
    pub fn new(broker: BrokerClient) -> Self {
        let executors = 8;
        let prefetch = broker.config().prefetch;
        let shutdown_grace = broker.config().shutdown_grace;
        Self {
            broker,
            executors,
            prefetch,
            queues: Vec::new(),
            middlewares: Vec::new(),
            retry_policy: Arc::new(NoopRetryPolicy),
            ack_on_restart_request: true,
            shutdown_grace,
        }
    }

    pub fn executors(mut self, n: usize) -> Self {
        self.executors = n.max(1);
        self
    }

    pub fn prefetch(mut self, n: usize) -> Self {
        self.prefetch = n;
        self
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queues.push(queue.into());
        self
    }

    pub fn middleware(mut self, middleware: impl Middleware + 'static) -> Self {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    pub fn retry_policy(mut self, policy: impl RetryPolicy + 'static) -> Self {
        self.retry_policy = Arc::new(policy);
        self
    }

    /// Whether a `RestartRequested` outcome acks (default) or nacks the
    /// current message.
    pub fn ack_on_restart_request(mut self, ack: bool) -> Self {
        self.ack_on_restart_request = ack;
        self
    }

    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn build(self) -> Worker {
        let consumers = self
            .queues
            .iter()
            .map(|q| self.broker.consume(q.clone(), self.prefetch))
            .collect();
        Worker {
            broker: self.broker,
            consumers,
            executors: self.executors,
            middlewares: self.middlewares,
            retry_policy: self.retry_policy,
            ack_on_restart_request: self.ack_on_restart_request,
            shutdown_grace: self.shutdown_grace,
            restart_requested: Arc::new(AtomicBool::new(false)),
            state: WorkerState::Running,
        }
    }
}

/// The process-level coordinator: an executor pool, the set of consumers,
/// the middleware chain, and the restart state machine.
pub struct Worker {
    broker: BrokerClient,
    consumers: Vec<Consumer>,
    executors: usize,
    middlewares: Vec<Arc<dyn Middleware>>,
    retry_policy: Arc<dyn RetryPolicy>,
    ack_on_restart_request: bool,
    shutdown_grace: Duration,
    restart_requested: Arc<AtomicBool>,
    state: WorkerState,
}

impl Worker {
    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle::new(self.restart_requested.clone())
    }

    /// Current point in the `Running -> RestartPending -> Draining` state
    /// machine. Reflects only what's happened up to the call site: once
    /// [`Worker::run`] is called it takes ownership of the worker, so this
    /// is most useful right after [`WorkerBuilder::build`].
    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Runs every subscribed consumer's prefetch loop and an executor pool
    /// of `task_fn` invocations until the process should exit, returning the
    /// exit code an external supervisor should act on.
    pub async fn run<F, Fut>(mut self, task_fn: F) -> i32
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Outcome> + Send + 'static,
    {
        let task_fn: TaskFn = Arc::new(move |msg| Box::pin(task_fn(msg)));
        let shutdown = CancellationToken::new();

        let (tx, rx) = mpsc::channel::<Message>(self.executors.max(1));
        let rx = Arc::new(Mutex::new(rx));

        let mut forwarders = Vec::new();
        for consumer in self.consumers.drain(..) {
            let tx = tx.clone();
            let cancel = shutdown.clone();
            forwarders.push(tokio::spawn(forward(consumer, tx, cancel)));
        }
        drop(tx);

        let mut executors = Vec::new();
        for _ in 0..self.executors {
            let rx = rx.clone();
            let broker = self.broker.clone();
            let middlewares = self.middlewares.clone();
            let retry_policy = self.retry_policy.clone();
            let handle = self.handle();
            let task_fn = task_fn.clone();
            let shutdown = shutdown.clone();
            let ack_on_restart = self.ack_on_restart_request;
            executors.push(tokio::spawn(execute(
                rx,
                broker,
                middlewares,
                retry_policy,
                handle,
                task_fn,
                shutdown,
                ack_on_restart,
            )));
        }

        // Wait for either an external shutdown signal or a middleware-driven
        // restart request, whichever comes first.
        tokio::select! {
            _ = wait_for_signal() => {
                info!("received shutdown signal, draining");
            }
            _ = watch_restart(self.restart_requested.clone()) => {
                info!("restart requested, draining");
                self.state = WorkerState::RestartPending;
            }
        }
        self.state = WorkerState::Draining;
        shutdown.cancel();

        for middleware in &self.middlewares {
            middleware.on_event(&self.handle(), &Event::BeforeConsumerStop);
        }

        // Reclaim the consumers from their forwarder tasks and close them,
        // requeueing anything still buffered.
        let mut reclaimed = Vec::with_capacity(forwarders.len());
        for forwarder in forwarders {
            if let Ok(consumer) = forwarder.await {
                reclaimed.push(consumer);
            }
        }
        for consumer in reclaimed {
            if let Err(err) = consumer.close().await {
                warn!(error = %err, "failed to requeue buffered messages on shutdown");
            }
        }

        let grace = self.shutdown_grace;
        let join_all = async {
            for executor in executors {
                let _ = executor.await;
            }
        };
        if tokio::time::timeout(grace, join_all).await.is_err() {
            error!("shutdown grace period exceeded, exiting hard");
        }

        if self.restart_requested.load(Ordering::SeqCst) {
            EXIT_RESTART_REQUESTED
        } else {
            EXIT_CLEAN
        }
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(_) => return std::future::pending().await,
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

async fn watch_restart(flag: Arc<AtomicBool>) {
    loop {
        if flag.load(Ordering::SeqCst) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

async fn forward(mut consumer: Consumer, tx: mpsc::Sender<Message>, cancel: CancellationToken) -> Consumer {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            maybe = consumer.next_message() => {
                match maybe {
                    Some(message) => {
                        if tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }
    consumer
}

#[allow(clippy::too_many_arguments)]
async fn execute(
    rx: Arc<Mutex<mpsc::Receiver<Message>>>,
    broker: BrokerClient,
    middlewares: Vec<Arc<dyn Middleware>>,
    retry_policy: Arc<dyn RetryPolicy>,
    handle: WorkerHandle,
    task_fn: TaskFn,
    shutdown: CancellationToken,
    ack_on_restart_request: bool,
) {
    loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => break,
            message = async {
                let mut rx = rx.lock().await;
                rx.recv().await
            } => match message {
                Some(message) => message,
                None => break,
            },
        };

        for middleware in &middlewares {
            middleware.on_event(&handle, &Event::BeforeProcess(&message));
        }

        let outcome = task_fn(message.clone()).await;

        for middleware in &middlewares {
            middleware.on_event(&handle, &Event::AfterProcess(&message, &outcome));
        }

        let result = match &outcome {
            Outcome::Success => broker.ack(&message.queue, &message.id).await,
            Outcome::Retryable(err) => match retry_policy.handle_retryable(&message, err.as_ref()) {
                RetryDecision::Ack => broker.ack(&message.queue, &message.id).await,
                RetryDecision::LeaveInFlight => Ok(()),
            },
            Outcome::Terminal(_) => broker.nack(&message.queue, &message.id).await,
            Outcome::RestartRequested => {
                if ack_on_restart_request {
                    broker.ack(&message.queue, &message.id).await
                } else {
                    broker.nack(&message.queue, &message.id).await
                }
            }
        };
        if let Err(err) = result {
            error!(message_id = %message.id, error = %err, "failed to ack/nack message");
        }

        if handle.restart_requested() {
            break;
        }
    }
}
