//! Broker transport abstraction
//!
//! Object-safe traits covering the broker operations this crate consumes:
//! declare-queue, set-prefetch, publish, basic-consume and cancel-consume.
//! [`AmqpConnector`] is the production implementation over `lapin`;
//! [`MemoryBroker`] is an in-process implementation with scriptable failures
//! used by the test suites.

mod amqp;
mod memory;

pub use amqp::AmqpConnector;
pub use memory::{MemoryBroker, PublishedMessage};

use crate::error::BrokerResult;
use crate::message::{DeliveryMode, MessageProperties};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Opens physical connections to a broker.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self, host: &str, port: u16) -> BrokerResult<Box<dyn BrokerConnection>>;
}

/// One physical broker connection.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Whether the connection still reports open.
    fn is_open(&self) -> bool;

    /// Open a channel multiplexed over this connection.
    async fn open_channel(&self) -> BrokerResult<Arc<dyn BrokerChannel>>;

    /// Close the connection and everything multiplexed over it.
    async fn close(&self) -> BrokerResult<()>;
}

/// One channel; owns queue, publish and consume operations.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Whether the channel still reports open.
    fn is_open(&self) -> bool;

    /// Declare a queue, creating it if absent.
    async fn declare_queue(&self, queue: &str, durable: bool) -> BrokerResult<()>;

    /// Limit the number of unacknowledged deliveries held by a consumer.
    async fn set_prefetch(&self, count: u16) -> BrokerResult<()>;

    /// Publish a message.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        mode: DeliveryMode,
        headers: Option<&HashMap<String, Value>>,
    ) -> BrokerResult<()>;

    /// Start a consumer on `queue`; returns the consumer tag and the
    /// delivery stream.
    async fn consume(
        &self,
        queue: &str,
        auto_ack: bool,
    ) -> BrokerResult<(String, Box<dyn DeliveryStream>)>;

    /// Cancel a consumer. Returns any unacknowledged deliveries the broker
    /// hands back with the cancellation; implementations that cannot surface
    /// them here return an empty list and let them drain through the stream.
    async fn cancel(&self, consumer_tag: &str) -> BrokerResult<Vec<Delivery>>;
}

/// Pull-based stream of deliveries for one consumer.
#[async_trait]
pub trait DeliveryStream: Send {
    /// Next delivery; `None` once the consumer is cancelled and drained, or
    /// the connection is gone.
    async fn next(&mut self) -> Option<BrokerResult<Delivery>>;
}

/// Acknowledgement handle for one delivery.
#[async_trait]
pub trait DeliveryAcker: Send + Sync {
    async fn ack(&self) -> BrokerResult<()>;
    async fn nack(&self, requeue: bool) -> BrokerResult<()>;
}

/// One consumed message.
pub struct Delivery {
    pub body: Vec<u8>,
    pub routing_key: String,
    pub exchange: String,
    pub redelivered: bool,
    pub properties: MessageProperties,
    acker: Option<Box<dyn DeliveryAcker>>,
}

impl Delivery {
    /// Build a delivery; transports attach the acker, test code may pass
    /// `None` for auto-acknowledged deliveries.
    pub fn new(
        body: Vec<u8>,
        routing_key: String,
        exchange: String,
        redelivered: bool,
        properties: MessageProperties,
        acker: Option<Box<dyn DeliveryAcker>>,
    ) -> Self {
        Self {
            body,
            routing_key,
            exchange,
            redelivered,
            properties,
            acker,
        }
    }

    /// Acknowledge the delivery. A no-op for auto-acknowledged deliveries.
    pub async fn ack(&self) -> BrokerResult<()> {
        match &self.acker {
            Some(acker) => acker.ack().await,
            None => Ok(()),
        }
    }

    /// Reject the delivery, optionally requeueing it.
    pub async fn nack(&self, requeue: bool) -> BrokerResult<()> {
        match &self.acker {
            Some(acker) => acker.nack(requeue).await,
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("body_len", &self.body.len())
            .field("routing_key", &self.routing_key)
            .field("exchange", &self.exchange)
            .field("redelivered", &self.redelivered)
            .field("properties", &self.properties)
            .finish()
    }
}
