use std::fmt;

/// Errors surfaced by the broker client, consumer, and worker.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum BrokerError {
    /// Failure obtaining a connection from the pool.
    #[error("redis connection pool error: {0}")]
    Connection(#[from] bb8::RunError<redis::RedisError>),

    /// A Redis command or script invocation failed.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// The broker script returned a shape the client didn't expect.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// `ack`/`nack` was called twice for the same delivery.
    #[error("cannot ack or nack the same message twice")]
    CannotAckOrNackTwice,

    /// The operation isn't supported by the current configuration.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    /// A catch-all for errors from caller-supplied codecs, etc.
    #[error("{0}")]
    Generic(Box<dyn std::error::Error + Send + Sync>),
}

impl BrokerError {
    pub fn generic<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Generic(Box::new(err))
    }

    pub fn protocol(msg: impl fmt::Display) -> Self {
        Self::Protocol(msg.to_string())
    }
}

pub type Result<T, E = BrokerError> = std::result::Result<T, E>;
