use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::broker::BrokerClient;
use crate::error::Result;
use crate::message::Message;

const MIN_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_secs(1);
const MIN_REFRESH: Duration = Duration::from_millis(50);

/// `Idle -> Fetching -> Serving -> Draining -> Closed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConsumerState {
    Idle,
    Fetching,
    Serving,
    Draining,
    Closed,
}

/// One per (worker, queue) pair. Prefetches into a bounded in-memory buffer
/// on a background task, and on [`Consumer::close`] requeues whatever is
/// still buffered at its originally-fetched priority.
pub struct Consumer {
    broker: BrokerClient,
    queue: String,
    receiver: mpsc::Receiver<Message>,
    cancel: CancellationToken,
    task: Option<JoinHandle<Vec<(String, i64)>>>,
    state: ConsumerState,
}

impl Consumer {
    pub(crate) fn new(broker: BrokerClient, queue: String, prefetch: usize) -> Self {
        let prefetch = prefetch.max(1);
        let (tx, rx) = mpsc::channel(prefetch);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(fetch_loop(
            broker.clone(),
            queue.clone(),
            prefetch,
            tx,
            cancel.clone(),
        ));
        Self {
            broker,
            queue,
            receiver: rx,
            cancel,
            task: Some(task),
            state: ConsumerState::Idle,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    /// Returns a message whose ack-group membership in Redis is guaranteed.
    /// The caller must eventually `ack` or `nack` it (or let crash recovery
    /// do so). Returns `None` once the consumer has been closed and its
    /// buffer drained.
    pub async fn next_message(&mut self) -> Option<Message> {
        self.state = ConsumerState::Serving;
        self.receiver.recv().await
    }

    /// Like [`next_message`](Self::next_message), but never blocks.
    pub fn try_next_message(&mut self) -> Option<Message> {
        self.receiver.try_recv().ok()
    }

    /// Stops fetching, requeues every buffered-but-undelivered message at
    /// its original priority, and waits for the background task to exit.
    pub async fn close(mut self) -> Result<()> {
        self.state = ConsumerState::Draining;
        self.cancel.cancel();

        let mut leftover = Vec::new();
        if let Some(task) = self.task.take() {
            // Drain concurrently with the join instead of doing a single
            // drain pass before awaiting the task: the task may still be
            // blocked inside `tx.send(message).await` when cancellation is
            // observed, and that send can complete only once this loop
            // frees up channel capacity. A drain-then-join ordering can
            // miss exactly that message.
            //
            // The channel only closes once the task drops its sender, i.e.
            // once the task has returned, so looping on `recv()` until it
            // reports closed drains everything the task ever sent. The task
            // branch is polled alongside it purely to capture the task's
            // own return value (the messages it held but never sent) as
            // soon as it's available, without assuming which branch a
            // given poll resolves first.
            tokio::pin!(task);
            let mut task_result = None;
            loop {
                tokio::select! {
                    received = self.receiver.recv() => match received {
                        Some(msg) => leftover.push((msg.id, msg.priority)),
                        None => break,
                    },
                    result = &mut task, if task_result.is_none() => {
                        task_result = Some(result);
                    }
                }
            }
            let task_result = match task_result {
                Some(result) => result,
                None => task.await,
            };
            if let Ok(mut unsent) = task_result {
                leftover.append(&mut unsent);
            }
        }

        self.state = ConsumerState::Closed;
        self.broker.requeue_batch(&self.queue, &leftover).await
    }
}

/// Background prefetch loop. On cancellation, returns whatever it had
/// already pulled from Redis but not yet handed to the consumer, so
/// [`Consumer::close`] can requeue it.
async fn fetch_loop(
    broker: BrokerClient,
    queue: String,
    prefetch: usize,
    tx: mpsc::Sender<Message>,
    cancel: CancellationToken,
) -> Vec<(String, i64)> {
    let mut backoff = MIN_BACKOFF;
    let mut last_fetch = Instant::now()
        .checked_sub(MIN_REFRESH)
        .unwrap_or_else(Instant::now);

    loop {
        if cancel.is_cancelled() {
            return Vec::new();
        }

        let buffered = prefetch.saturating_sub(tx.capacity());
        let need_refill = buffered < prefetch.div_ceil(2) && last_fetch.elapsed() >= MIN_REFRESH;
        if !need_refill {
            tokio::select! {
                _ = cancel.cancelled() => return Vec::new(),
                _ = tokio::time::sleep(MIN_REFRESH) => continue,
            }
        }

        last_fetch = Instant::now();
        let want = prefetch - buffered;
        match broker.fetch_raw(&queue, want).await {
            Ok(messages) if messages.is_empty() => {
                trace!(queue = %queue, "fetch returned no messages, backing off");
                tokio::select! {
                    _ = cancel.cancelled() => return Vec::new(),
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
            Ok(messages) => {
                backoff = MIN_BACKOFF;
                let mut iter = messages.into_iter();
                while let Some(message) = iter.next() {
                    if cancel.is_cancelled() {
                        let mut leftover = vec![(message.id, message.priority)];
                        leftover.extend(iter.map(|m| (m.id, m.priority)));
                        return leftover;
                    }
                    let id = message.id.clone();
                    let priority = message.priority;
                    if tx.send(message).await.is_err() {
                        let mut leftover = vec![(id, priority)];
                        leftover.extend(iter.map(|m| (m.id, m.priority)));
                        return leftover;
                    }
                }
            }
            Err(err) => {
                warn!(queue = %queue, error = %err, "fetch failed, backing off");
                tokio::select! {
                    _ = cancel.cancelled() => return Vec::new(),
                    _ = tokio::time::sleep(backoff) => {}
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
}
