use thiserror::Error;

/// Result type for broker operations
pub type BrokerResult<T> = std::result::Result<T, BrokerError>;

/// Errors raised by broker operations after construction.
///
/// Connection-level and channel-level failures are kept as separate variants
/// so callers (and logs) can tell which layer failed.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Connection-level failure (socket lost, broker closed the connection)
    #[error("Connection error: {0}")]
    Connection(String),

    /// Channel-level failure (channel closed by the broker, precondition failed)
    #[error("Channel error: {0}")]
    Channel(String),

    /// Consume stream failure
    #[error("Consume error: {0}")]
    Consume(String),

    /// Consumer cancellation failure
    #[error("Cancel error: {0}")]
    Cancel(String),

    /// Operation requires an established connection; call `connect()` first
    #[error("Not connected: call connect() first")]
    NotConnected,

    /// Header or payload serialization failure
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid parameter passed to an operation
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        BrokerError::Serialization(err.to_string())
    }
}

/// Construction-time validation errors.
///
/// One variant per offending parameter, raised eagerly and never deferred.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("host must not be empty")]
    EmptyHost,

    #[error("port must be a positive integer")]
    InvalidPort,

    #[error("connection_attempts must be a positive integer")]
    InvalidConnectionAttempts,

    #[error("retry_delay must be a positive duration")]
    InvalidRetryDelay,

    #[error("health port must be a positive integer")]
    InvalidHealthPort,

    #[error("status code must be within 100..=599, got {0}")]
    InvalidStatusCode(u16),

    #[error("queue name must not be empty")]
    EmptyQueue,
}

/// Errors raised while starting the health listener.
#[derive(Debug, Error)]
pub enum HealthError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to bind health listener: {0}")]
    Bind(#[from] std::io::Error),
}

/// Errors raised by an external session store.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session store error: {0}")]
    Store(String),
}
