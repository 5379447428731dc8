use std::env;
use std::time::Duration;

/// Environment variable read once at startup for the default message priority.
///
/// Lower values are executed first. See [`BrokerConfig::from_env`].
pub const DEFAULT_PRIORITY_ENV_VAR: &str = "dramatiq_actor_default_priority";

/// Static, process-wide broker configuration.
///
/// A plain struct with public fields: no builder type-state, just fields and
/// a couple of constructors.
#[derive(Clone, Debug)]
pub struct BrokerConfig {
    /// Key prefix under which all broker state lives in Redis.
    pub namespace: String,
    /// Dsn passed to `bb8_redis::RedisConnectionManager`.
    pub redis_dsn: String,
    /// Max size of the underlying connection pool.
    pub max_connections: u32,
    /// A worker is considered dead once its heartbeat is older than this.
    pub heartbeat_timeout: Duration,
    /// Dead-lettered messages older than this are evicted by maintenance.
    pub dead_message_ttl: Duration,
    /// Probability in (0, 1] that any given script call also runs maintenance.
    pub maintenance_probability: f64,
    /// Priority assigned to messages enqueued without an explicit priority.
    pub default_priority: i64,
    /// Per-consumer prefetch upper bound, default is `2 * executors`.
    pub prefetch: usize,
    /// `0` disables the `MaxTasksPerChild` restart middleware.
    pub max_tasks_per_child: usize,
    /// Grace period before a draining worker escalates to a hard exit.
    pub shutdown_grace: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            namespace: "dramatiq".to_owned(),
            redis_dsn: "redis://localhost".to_owned(),
            max_connections: 16,
            heartbeat_timeout: Duration::from_secs(60),
            dead_message_ttl: Duration::from_secs(7 * 24 * 3600),
            maintenance_probability: 0.01,
            default_priority: 0,
            prefetch: 16,
            max_tasks_per_child: 0,
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl BrokerConfig {
    /// Builds the default config, then overrides `default_priority` from
    /// [`DEFAULT_PRIORITY_ENV_VAR`] if it's set and parses as an integer.
    ///
    /// The env var is read exactly once here; later per-call priorities
    /// always take precedence over this default.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(raw) = env::var(DEFAULT_PRIORITY_ENV_VAR) {
            if let Ok(priority) = raw.parse() {
                config.default_priority = priority;
            }
        }
        config
    }

    pub fn with_redis_dsn(mut self, dsn: impl Into<String>) -> Self {
        self.redis_dsn = dsn.into();
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub(crate) fn queue_key(&self, queue: &str) -> String {
        format!("{}:{queue}", self.namespace)
    }

    pub(crate) fn queue_msgs_key(&self, queue: &str) -> String {
        format!("{}:{queue}.msgs", self.namespace)
    }

    pub(crate) fn acks_key(&self, worker_id: &str, queue: &str) -> String {
        format!("{}:__acks__.{worker_id}.{queue}", self.namespace)
    }

    pub(crate) fn heartbeats_key(&self) -> String {
        format!("{}:__heartbeats__", self.namespace)
    }

    /// Strips a trailing `.DQ` suffix so a delayed queue shares its canonical
    /// queue's dead-letter queue.
    pub(crate) fn canonical_queue(queue: &str) -> &str {
        queue.strip_suffix(".DQ").unwrap_or(queue)
    }

    pub(crate) fn dlq_key(&self, queue: &str) -> String {
        format!("{}:{}.XQ", self.namespace, Self::canonical_queue(queue))
    }

    pub(crate) fn dlq_msgs_key(&self, queue: &str) -> String {
        format!("{}:{}.XQ.msgs", self.namespace, Self::canonical_queue(queue))
    }
}
