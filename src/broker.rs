use std::future::Future;
use std::time::Duration;

use bb8_redis::RedisConnectionManager;
use rand::Rng;
use tracing::warn;
use uuid::Uuid;

use crate::config::BrokerConfig;
use crate::consumer::Consumer;
use crate::error::{BrokerError, Result};
use crate::message::{encode_serde_json, Message};
use crate::script::BrokerScript;

/// Bounded exponential backoff for retrying transient broker errors (§7 item
/// 1): a connection pool timeout or a dropped/refused Redis connection is
/// worth retrying, since the in-flight ack groups it would have touched stay
/// put and maintenance will eventually rescue them anyway.
const RETRY_MIN_BACKOFF: Duration = Duration::from_millis(10);
const RETRY_MAX_BACKOFF: Duration = Duration::from_secs(1);
const RETRY_MAX_ATTEMPTS: u32 = 5;

fn is_transient(err: &BrokerError) -> bool {
    match err {
        BrokerError::Connection(_) => true,
        BrokerError::Redis(e) => {
            e.is_io_error() || e.is_timeout() || e.is_connection_dropped() || e.is_connection_refusal()
        }
        _ => false,
    }
}

/// Process-singleton handle to the Redis-backed broker.
///
/// Holds the connection pool, namespace/timeouts/maintenance-probability
/// config, and this process's stable worker id. Cheaply `Clone`-able: the
/// pool and script are both reference-counted internally.
#[derive(Clone)]
pub struct BrokerClient {
    pool: bb8::Pool<RedisConnectionManager>,
    config: BrokerConfig,
    script: BrokerScript,
    worker_id: Uuid,
}

impl BrokerClient {
    pub async fn connect(config: BrokerConfig) -> Result<Self> {
        let manager = RedisConnectionManager::new(config.redis_dsn.clone())
            .map_err(BrokerError::Redis)?;
        let pool = bb8::Pool::builder()
            .max_size(config.max_connections)
            .build(manager)
            .await
            .map_err(BrokerError::Redis)?;
        Ok(Self {
            pool,
            config,
            script: BrokerScript::new(),
            worker_id: Uuid::new_v4(),
        })
    }

    pub fn worker_id(&self) -> Uuid {
        self.worker_id
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    fn sample_maintenance(&self) -> bool {
        rand::thread_rng().gen::<f64>() < self.config.maintenance_probability
    }

    /// Runs `op` up to [`RETRY_MAX_ATTEMPTS`] times, backing off exponentially
    /// (capped at [`RETRY_MAX_BACKOFF`]) between attempts, but only while the
    /// error it returns is a transient connection failure. Any other error
    /// (a protocol mismatch, a script-level command error) is surfaced
    /// immediately.
    async fn with_retry<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut backoff = RETRY_MIN_BACKOFF;
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt + 1 < RETRY_MAX_ATTEMPTS && is_transient(&err) => {
                    warn!(attempt, error = %err, "transient broker error, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(RETRY_MAX_BACKOFF);
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    pub async fn enqueue(&self, queue: &str, msg_id: &str, payload: &[u8], priority: Option<i64>) -> Result<()> {
        let priority = priority.unwrap_or(self.config.default_priority);
        self.with_retry(|| async {
            let mut conn = self.pool.get().await?;
            self.script
                .enqueue(
                    &mut *conn,
                    &self.config,
                    &self.worker_id.to_string(),
                    queue,
                    self.sample_maintenance(),
                    msg_id,
                    payload,
                    priority,
                )
                .await
        })
        .await
    }

    pub async fn enqueue_serde_json<T: serde::Serialize>(
        &self,
        queue: &str,
        msg_id: &str,
        payload: &T,
        priority: Option<i64>,
    ) -> Result<()> {
        let bytes = encode_serde_json(payload)?;
        self.enqueue(queue, msg_id, &bytes, priority).await
    }

    /// Starts a consumer for `queue`, prefetching up to `prefetch` messages
    /// at a time.
    pub fn consume(&self, queue: impl Into<String>, prefetch: usize) -> Consumer {
        Consumer::new(self.clone(), queue.into(), prefetch)
    }

    pub async fn ack(&self, queue: &str, msg_id: &str) -> Result<()> {
        self.with_retry(|| async {
            let mut conn = self.pool.get().await?;
            self.script
                .ack(
                    &mut *conn,
                    &self.config,
                    &self.worker_id.to_string(),
                    queue,
                    self.sample_maintenance(),
                    msg_id,
                )
                .await
        })
        .await
    }

    pub async fn nack(&self, queue: &str, msg_id: &str) -> Result<()> {
        self.with_retry(|| async {
            let mut conn = self.pool.get().await?;
            self.script
                .nack(
                    &mut *conn,
                    &self.config,
                    &self.worker_id.to_string(),
                    queue,
                    self.sample_maintenance(),
                    msg_id,
                )
                .await
        })
        .await
    }

    /// Returns unfetched messages (carrying the priority they were fetched
    /// at) back to the front of the queue. Used by a closing consumer to
    /// restore buffered-but-undelivered messages.
    pub async fn requeue_batch(&self, queue: &str, batch: &[(String, i64)]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.with_retry(|| async {
            let mut conn = self.pool.get().await?;
            self.script
                .requeue(
                    &mut *conn,
                    &self.config,
                    &self.worker_id.to_string(),
                    queue,
                    self.sample_maintenance(),
                    batch,
                )
                .await
        })
        .await
    }

    pub async fn purge(&self, queue: &str) -> Result<()> {
        self.with_retry(|| async {
            let mut conn = self.pool.get().await?;
            self.script
                .purge(
                    &mut *conn,
                    &self.config,
                    &self.worker_id.to_string(),
                    queue,
                    self.sample_maintenance(),
                )
                .await
        })
        .await
    }

    /// Test-only: the number of messages currently stored (queued or
    /// in-flight for this worker) for `queue`.
    pub async fn qsize(&self, queue: &str) -> Result<i64> {
        self.with_retry(|| async {
            let mut conn = self.pool.get().await?;
            self.script
                .qsize(
                    &mut *conn,
                    &self.config,
                    &self.worker_id.to_string(),
                    queue,
                    self.sample_maintenance(),
                )
                .await
        })
        .await
    }

    pub(crate) async fn fetch_raw(&self, queue: &str, count: usize) -> Result<Vec<Message>> {
        let rows = self
            .with_retry(|| async {
                let mut conn = self.pool.get().await?;
                self.script
                    .fetch(
                        &mut *conn,
                        &self.config,
                        &self.worker_id.to_string(),
                        queue,
                        self.sample_maintenance(),
                        count,
                    )
                    .await
            })
            .await?;
        Ok(rows
            .into_iter()
            .map(|(id, payload, priority)| Message {
                id,
                queue: queue.to_owned(),
                priority,
                payload,
            })
            .collect())
    }
}
