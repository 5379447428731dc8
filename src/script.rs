//! The atomic dispatch script: a single `redis::Script`, parameterized by a
//! `command` argument rather than one script per command, so every call
//! shares a prelude (heartbeat refresh, canonical-queue resolution) and
//! maintenance sweep.

use std::time::{SystemTime, UNIX_EPOCH};

use redis::{aio::ConnectionLike, FromRedisValue, Value};

use crate::config::BrokerConfig;
use crate::error::{BrokerError, Result};

#[derive(Clone)]
pub(crate) struct BrokerScript {
    inner: redis::Script,
}

/// Keys every invocation resolves and passes, regardless of whether the
/// command in question needs all six.
struct ScriptKeys {
    queue_key: String,
    queue_msgs_key: String,
    acks_key: String,
    heartbeats_key: String,
    dlq_key: String,
    dlq_msgs_key: String,
}

impl ScriptKeys {
    fn for_queue(config: &BrokerConfig, worker_id: &str, queue: &str) -> Self {
        Self {
            queue_key: config.queue_key(queue),
            queue_msgs_key: config.queue_msgs_key(queue),
            acks_key: config.acks_key(worker_id, queue),
            heartbeats_key: config.heartbeats_key(),
            dlq_key: config.dlq_key(queue),
            dlq_msgs_key: config.dlq_msgs_key(queue),
        }
    }
}

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as i64
}

impl BrokerScript {
    pub(crate) fn new() -> Self {
        Self {
            inner: redis::Script::new(include_str!("lua/broker.lua")),
        }
    }

    fn invocation<'a>(
        &'a self,
        config: &BrokerConfig,
        worker_id: &str,
        queue: &str,
        command: &'static str,
        do_maintenance: bool,
    ) -> redis::ScriptInvocation<'a> {
        let keys = ScriptKeys::for_queue(config, worker_id, queue);
        let mut invocation = self.inner.prepare_invoke();
        invocation
            .key(keys.queue_key)
            .key(keys.queue_msgs_key)
            .key(keys.acks_key)
            .key(keys.heartbeats_key)
            .key(keys.dlq_key)
            .key(keys.dlq_msgs_key)
            .arg(command)
            .arg(now_ms())
            .arg(if do_maintenance { "1" } else { "0" })
            .arg(config.heartbeat_timeout.as_millis() as i64)
            .arg(config.dead_message_ttl.as_millis() as i64)
            .arg(&config.namespace)
            .arg(worker_id)
            .arg(queue);
        invocation
    }

    pub(crate) async fn enqueue<C: ConnectionLike + Send>(
        &self,
        conn: &mut C,
        config: &BrokerConfig,
        worker_id: &str,
        queue: &str,
        do_maintenance: bool,
        msg_id: &str,
        payload: &[u8],
        priority: i64,
    ) -> Result<()> {
        let _: Value = self
            .invocation(config, worker_id, queue, "enqueue", do_maintenance)
            .arg(msg_id)
            .arg(payload)
            .arg(priority)
            .invoke_async(conn)
            .await
            .map_err(BrokerError::Redis)?;
        Ok(())
    }

    pub(crate) async fn fetch<C: ConnectionLike + Send>(
        &self,
        conn: &mut C,
        config: &BrokerConfig,
        worker_id: &str,
        queue: &str,
        do_maintenance: bool,
        count: usize,
    ) -> Result<Vec<(String, Vec<u8>, i64)>> {
        let raw: Value = self
            .invocation(config, worker_id, queue, "fetch", do_maintenance)
            .arg(count)
            .invoke_async(conn)
            .await
            .map_err(BrokerError::Redis)?;
        parse_fetch_reply(raw)
    }

    pub(crate) async fn requeue<C: ConnectionLike + Send>(
        &self,
        conn: &mut C,
        config: &BrokerConfig,
        worker_id: &str,
        queue: &str,
        do_maintenance: bool,
        batch: &[(String, i64)],
    ) -> Result<()> {
        let mut invocation = self.invocation(config, worker_id, queue, "requeue", do_maintenance);
        for (msg_id, priority) in batch {
            invocation.arg(msg_id).arg(*priority);
        }
        let _: Value = invocation.invoke_async(conn).await.map_err(BrokerError::Redis)?;
        Ok(())
    }

    pub(crate) async fn ack<C: ConnectionLike + Send>(
        &self,
        conn: &mut C,
        config: &BrokerConfig,
        worker_id: &str,
        queue: &str,
        do_maintenance: bool,
        msg_id: &str,
    ) -> Result<()> {
        let _: Value = self
            .invocation(config, worker_id, queue, "ack", do_maintenance)
            .arg(msg_id)
            .invoke_async(conn)
            .await
            .map_err(BrokerError::Redis)?;
        Ok(())
    }

    pub(crate) async fn nack<C: ConnectionLike + Send>(
        &self,
        conn: &mut C,
        config: &BrokerConfig,
        worker_id: &str,
        queue: &str,
        do_maintenance: bool,
        msg_id: &str,
    ) -> Result<()> {
        let _: Value = self
            .invocation(config, worker_id, queue, "nack", do_maintenance)
            .arg(msg_id)
            .invoke_async(conn)
            .await
            .map_err(BrokerError::Redis)?;
        Ok(())
    }

    pub(crate) async fn purge<C: ConnectionLike + Send>(
        &self,
        conn: &mut C,
        config: &BrokerConfig,
        worker_id: &str,
        queue: &str,
        do_maintenance: bool,
    ) -> Result<()> {
        let _: Value = self
            .invocation(config, worker_id, queue, "purge", do_maintenance)
            .invoke_async(conn)
            .await
            .map_err(BrokerError::Redis)?;
        Ok(())
    }

    pub(crate) async fn qsize<C: ConnectionLike + Send>(
        &self,
        conn: &mut C,
        config: &BrokerConfig,
        worker_id: &str,
        queue: &str,
        do_maintenance: bool,
    ) -> Result<i64> {
        let size: i64 = self
            .invocation(config, worker_id, queue, "qsize", do_maintenance)
            .invoke_async(conn)
            .await
            .map_err(BrokerError::Redis)?;
        Ok(size)
    }
}

fn parse_fetch_reply(raw: Value) -> Result<Vec<(String, Vec<u8>, i64)>> {
    let items = match raw {
        Value::Bulk(items) => items,
        Value::Nil => Vec::new(),
        other => {
            return Err(BrokerError::protocol(format!(
                "fetch: expected an array reply, got {other:?}"
            )))
        }
    };

    if items.len() % 3 != 0 {
        return Err(BrokerError::protocol(
            "fetch: reply length is not a multiple of 3",
        ));
    }

    let mut out = Vec::with_capacity(items.len() / 3);
    for chunk in items.chunks(3) {
        let msg_id = String::from_redis_value(&chunk[0])
            .map_err(|_| BrokerError::protocol("fetch: bad message id"))?;
        let payload: Vec<u8> = match &chunk[1] {
            Value::Nil => Vec::new(),
            v => Vec::<u8>::from_redis_value(v)
                .map_err(|_| BrokerError::protocol("fetch: bad payload"))?,
        };
        let priority = parse_priority(&chunk[2])?;
        out.push((msg_id, payload, priority));
    }
    Ok(out)
}

fn parse_priority(value: &Value) -> Result<i64> {
    // `ZPOPMIN`/`ZRANGE ... WITHSCORES` scores come back as bulk strings
    // (e.g. "5" or "5.0") inside a Lua table; `redis` decodes them as
    // `Value::Data`. Parse defensively either way.
    match value {
        Value::Int(i) => Ok(*i),
        Value::Data(bytes) => std::str::from_utf8(bytes)
            .ok()
            .and_then(|s| s.parse::<f64>().ok())
            .map(|f| f as i64)
            .ok_or_else(|| BrokerError::protocol("fetch: bad priority")),
        other => Err(BrokerError::protocol(format!(
            "fetch: unexpected priority value {other:?}"
        ))),
    }
}
