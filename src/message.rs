//! Message envelope and metadata types

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Delivery mode requested for a published message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeliveryMode {
    /// The broker persists the message across a restart
    Persistent,
    /// No persistence guarantee
    Transient,
}

impl DeliveryMode {
    /// AMQP delivery-mode octet (2 = persistent, 1 = transient)
    pub fn as_amqp(self) -> u8 {
        match self {
            DeliveryMode::Persistent => 2,
            DeliveryMode::Transient => 1,
        }
    }
}

/// An outbound message.
///
/// The `durable` flag selects the delivery mode only; it never changes the
/// exchange or routing key. An empty `exchange` addresses the broker's
/// default exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Message payload
    pub body: Vec<u8>,

    /// Routing key (queue name when using the default exchange)
    pub routing_key: String,

    /// Target exchange; empty for the default exchange
    pub exchange: String,

    /// true requests persistent delivery, false transient
    pub durable: bool,

    /// Optional application headers
    pub headers: Option<HashMap<String, Value>>,
}

impl MessageEnvelope {
    /// Build a durable message for the default exchange.
    pub fn new(body: impl Into<Vec<u8>>, routing_key: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            routing_key: routing_key.into(),
            exchange: String::new(),
            durable: true,
            headers: None,
        }
    }

    /// Request transient delivery.
    pub fn transient(mut self) -> Self {
        self.durable = false;
        self
    }

    /// Target a named exchange.
    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self
    }

    /// Attach an application header.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.headers
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }

    /// Attach a `session_id` header for session correlation.
    pub fn with_session_id(self, session_id: impl Into<String>) -> Self {
        self.with_header("session_id", session_id.into())
    }

    /// Delivery mode implied by the `durable` flag.
    pub fn delivery_mode(&self) -> DeliveryMode {
        if self.durable {
            DeliveryMode::Persistent
        } else {
            DeliveryMode::Transient
        }
    }
}

/// Metadata attached to an inbound delivery.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageProperties {
    /// Application headers, if the publisher set any
    pub headers: Option<HashMap<String, Value>>,
}

impl MessageProperties {
    pub fn with_headers(headers: HashMap<String, Value>) -> Self {
        Self {
            headers: Some(headers),
        }
    }
}
