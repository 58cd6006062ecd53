//! Broker connection lifecycle
//!
//! [`ConnectionManager`] owns one connection/channel pair: bounded-retry
//! establishment, a readiness predicate, and idempotent teardown. Publishers
//! and subscribers borrow the channel through [`ConnectionManager::channel`].

mod backoff;

pub use backoff::{BackoffPolicy, FixedDelay};

use crate::config::ConnectionConfig;
use crate::error::{BrokerError, BrokerResult};
use crate::transport::{AmqpConnector, BrokerChannel, BrokerConnection, BrokerConnector};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

/// Post-connect hook for declaring queues, exchanges and bindings.
///
/// Runs exactly once per successful `connect()`, against the fresh channel,
/// never during construction. A failing hook tears the connection down and
/// counts as a failed attempt.
#[async_trait]
pub trait SetupHook: Send + Sync {
    async fn setup(&self, channel: &dyn BrokerChannel) -> BrokerResult<()>;
}

struct NoopSetup;

#[async_trait]
impl SetupHook for NoopSetup {
    async fn setup(&self, _channel: &dyn BrokerChannel) -> BrokerResult<()> {
        Ok(())
    }
}

struct Pair {
    connection: Box<dyn BrokerConnection>,
    channel: Arc<dyn BrokerChannel>,
}

/// Owns one broker connection and its channel.
///
/// Not internally synchronized for concurrent publishes over one channel;
/// callers serialize, or use one manager per task.
pub struct ConnectionManager {
    config: ConnectionConfig,
    connector: Arc<dyn BrokerConnector>,
    backoff: Arc<dyn BackoffPolicy>,
    setup: Arc<dyn SetupHook>,
    state: Mutex<Option<Pair>>,
}

impl ConnectionManager {
    /// Build a manager over an explicit transport.
    pub fn new(config: ConnectionConfig, connector: Arc<dyn BrokerConnector>) -> Self {
        let backoff = Arc::new(FixedDelay::new(config.retry_delay));
        Self {
            config,
            connector,
            backoff,
            setup: Arc::new(NoopSetup),
            state: Mutex::new(None),
        }
    }

    /// Build a manager over the AMQP transport.
    pub fn amqp(config: ConnectionConfig) -> Self {
        Self::new(config, Arc::new(AmqpConnector::new()))
    }

    /// Install a post-connect setup hook.
    pub fn with_setup(mut self, setup: Arc<dyn SetupHook>) -> Self {
        self.setup = setup;
        self
    }

    /// Replace the retry delay policy.
    pub fn with_backoff(mut self, backoff: Arc<dyn BackoffPolicy>) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Attempt to connect, retrying up to `connection_attempts` times with
    /// the backoff delay between attempts (none after the final failure).
    ///
    /// Returns true on success and false on exhaustion; the caller decides
    /// whether that is fatal. On success the setup hook has run exactly once.
    pub async fn connect(&self) -> bool {
        let attempts = self.config.connection_attempts;
        for attempt in 1..=attempts {
            tracing::info!(
                host = %self.config.host,
                port = self.config.port,
                attempt,
                attempts,
                "Connecting to broker"
            );
            match self.try_connect().await {
                Ok(()) => {
                    tracing::info!(host = %self.config.host, "Connected to broker");
                    return true;
                }
                Err(e) => {
                    tracing::warn!(error = %e, attempt, "Broker connection attempt failed");
                    if attempt < attempts {
                        tokio::time::sleep(self.backoff.delay(attempt)).await;
                    }
                }
            }
        }
        tracing::error!(attempts, "Failed to connect to broker; attempts exhausted");
        false
    }

    async fn try_connect(&self) -> BrokerResult<()> {
        let connection = self
            .connector
            .connect(&self.config.host, self.config.port)
            .await?;
        let channel = connection.open_channel().await?;
        if let Err(e) = self.setup.setup(channel.as_ref()).await {
            let _ = connection.close().await;
            return Err(e);
        }
        *self.state.lock() = Some(Pair {
            connection,
            channel,
        });
        Ok(())
    }

    /// True iff the connection and channel both report open.
    pub fn is_ready(&self) -> bool {
        let state = self.state.lock();
        match state.as_ref() {
            Some(pair) => pair.connection.is_open() && pair.channel.is_open(),
            None => false,
        }
    }

    /// The channel, when ready.
    pub fn channel(&self) -> BrokerResult<Arc<dyn BrokerChannel>> {
        let state = self.state.lock();
        match state.as_ref() {
            Some(pair) if pair.connection.is_open() && pair.channel.is_open() => {
                Ok(pair.channel.clone())
            }
            _ => Err(BrokerError::NotConnected),
        }
    }

    /// Close the connection. Idempotent and infallible: a close failure is
    /// logged, and closing an already-closed connection is a distinct no-op.
    pub async fn disconnect(&self) {
        let pair = self.state.lock().take();
        match pair {
            Some(pair) if pair.connection.is_open() => {
                match pair.connection.close().await {
                    Ok(()) => tracing::info!("Broker connection closed"),
                    Err(e) => tracing::warn!(error = %e, "Error closing broker connection"),
                }
            }
            _ => tracing::debug!("Broker connection already closed"),
        }
    }
}
