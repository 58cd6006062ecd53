//! Readiness-gated message publishing

use crate::connection::ConnectionManager;
use crate::error::{BrokerError, BrokerResult};
use crate::message::MessageEnvelope;
use std::sync::Arc;

/// Publishes messages through an established connection.
///
/// Requires the manager to be ready; there is no implicit reconnect. The
/// envelope's `durable` flag selects the delivery mode and nothing else.
pub struct Publisher {
    manager: Arc<ConnectionManager>,
}

impl Publisher {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self { manager }
    }

    /// Publish one message.
    ///
    /// Fails with [`BrokerError::NotConnected`] before any broker call when
    /// the connection is not ready. Channel-level and connection-level
    /// failures are logged with their cause and propagated.
    pub async fn publish(&self, message: &MessageEnvelope) -> BrokerResult<()> {
        let channel = self.manager.channel()?;
        let mode = message.delivery_mode();

        let result = channel
            .publish(
                &message.exchange,
                &message.routing_key,
                &message.body,
                mode,
                message.headers.as_ref(),
            )
            .await;

        match result {
            Ok(()) => {
                tracing::debug!(
                    exchange = %message.exchange,
                    routing_key = %message.routing_key,
                    ?mode,
                    "Published message"
                );
                Ok(())
            }
            Err(e @ BrokerError::Channel(_)) => {
                tracing::error!(
                    error = %e,
                    routing_key = %message.routing_key,
                    "Channel error during publish"
                );
                Err(e)
            }
            Err(e @ BrokerError::Connection(_)) => {
                tracing::error!(
                    error = %e,
                    routing_key = %message.routing_key,
                    "Connection error during publish"
                );
                Err(e)
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    routing_key = %message.routing_key,
                    "Publish failed"
                );
                Err(e)
            }
        }
    }
}
