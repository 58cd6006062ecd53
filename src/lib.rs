//! Reusable AMQP client layer for message-driven services
//!
//! Provides the pieces a broker-backed service wires together: bounded-retry
//! connection establishment, publish/consume with delivery-durability
//! control, graceful subscription teardown with unacknowledged-message
//! handling, session correlation from message metadata, and an independent
//! HTTP health surface.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────┐
//! │               Owning service                   │
//! │  (wires the capabilities, flips readiness)     │
//! └────────────────────────────────────────────────┘
//!      │            │              │           │
//!      ▼            ▼              ▼           ▼
//! ┌──────────┐ ┌──────────┐ ┌────────────┐ ┌─────────────┐
//! │Publisher │ │Subscriber│ │HealthServer│ │ Session     │
//! │          │ │          │ │  (axum)    │ │ Correlator  │
//! └──────────┘ └──────────┘ └────────────┘ └─────────────┘
//!      │            │
//!      ▼            ▼
//! ┌────────────────────────┐
//! │   ConnectionManager    │
//! ├────────────────────────┤
//! │   BrokerConnector seam │
//! │  (lapin / in-memory)   │
//! └────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use amqp_service_kit::{
//!     ConnectionConfig, ConnectionManager, HealthServer, MessageEnvelope, Publisher,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let health = HealthServer::start(8000).await?;
//!
//!     let config = ConnectionConfig::new("localhost", 5672, 5, Duration::from_secs(5))?;
//!     let manager = Arc::new(ConnectionManager::amqp(config));
//!     if !manager.connect().await {
//!         // the caller decides whether exhausted retries are fatal
//!         return Err("broker unreachable".into());
//!     }
//!
//!     let publisher = Publisher::new(manager.clone());
//!     publisher
//!         .publish(&MessageEnvelope::new(b"hello".to_vec(), "greetings"))
//!         .await?;
//!
//!     health.set_ready(true);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod health;
pub mod message;
pub mod publisher;
pub mod session;
pub mod subscriber;
pub mod transport;

pub use config::ConnectionConfig;
pub use connection::{BackoffPolicy, ConnectionManager, FixedDelay, SetupHook};
pub use error::{BrokerError, BrokerResult, ConfigError, HealthError, SessionError};
pub use health::{HealthServer, HealthState};
pub use message::{DeliveryMode, MessageEnvelope, MessageProperties};
pub use publisher::Publisher;
pub use session::{
    extract_session_id, InMemorySessionStore, SessionCorrelator, SessionState, SessionStore,
};
pub use subscriber::{MessageHandler, Subscriber, UnackedHandler};
pub use transport::{
    AmqpConnector, BrokerChannel, BrokerConnection, BrokerConnector, Delivery, DeliveryAcker,
    DeliveryStream, MemoryBroker, PublishedMessage,
};
