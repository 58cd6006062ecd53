//! Queue subscription lifecycle
//!
//! One [`Subscriber`] manages at most one active subscription: it declares
//! the queue durable, sets fair-dispatch prefetch to 1, then blocks the
//! calling task in a receive loop until [`Subscriber::stop`] is invoked from
//! another task or the connection fails. A controlled stop hands any
//! unacknowledged in-flight deliveries to the owner-supplied handler, which
//! is where at-least-once semantics survive the teardown.

use crate::connection::ConnectionManager;
use crate::error::{BrokerResult, ConfigError};
use crate::transport::{BrokerChannel, Delivery};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Per-message callback.
///
/// With `auto_ack = false` the handler owns acknowledgement: call
/// [`Delivery::ack`] once the message is processed, or leave it pending for
/// redelivery per broker policy.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, delivery: Delivery);
}

/// Receives the unacknowledged deliveries surfaced by a controlled stop.
#[async_trait]
pub trait UnackedHandler: Send + Sync {
    async fn handle_unacknowledged(&self, deliveries: Vec<Delivery>);
}

struct LogUnacked;

#[async_trait]
impl UnackedHandler for LogUnacked {
    async fn handle_unacknowledged(&self, deliveries: Vec<Delivery>) {
        tracing::warn!(
            count = deliveries.len(),
            "No unacknowledged-message handler installed; broker will redeliver"
        );
    }
}

struct ActiveSub {
    consumer_tag: String,
    channel: Arc<dyn BrokerChannel>,
    cancelling: AtomicBool,
}

/// Manages a single active queue subscription.
pub struct Subscriber {
    manager: Arc<ConnectionManager>,
    queue: Mutex<String>,
    active: Mutex<Option<Arc<ActiveSub>>>,
    unacked: Arc<dyn UnackedHandler>,
}

impl Subscriber {
    /// Build a subscriber for `queue`. Rejects empty queue names.
    pub fn new(
        manager: Arc<ConnectionManager>,
        queue: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let queue = queue.into();
        if queue.trim().is_empty() {
            return Err(ConfigError::EmptyQueue);
        }
        Ok(Self {
            manager,
            queue: Mutex::new(queue),
            active: Mutex::new(None),
            unacked: Arc::new(LogUnacked),
        })
    }

    /// Install the owner's unacknowledged-message handler.
    pub fn with_unacked_handler(mut self, handler: Arc<dyn UnackedHandler>) -> Self {
        self.unacked = handler;
        self
    }

    /// Current target queue.
    pub fn queue(&self) -> String {
        self.queue.lock().clone()
    }

    /// Whether a subscription is currently active.
    pub fn is_active(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Change the target queue.
    ///
    /// Setting the current value is a no-op. A different value while
    /// subscribed triggers exactly one [`stop`](Self::stop) before the field
    /// updates; while idle it is a pure field update.
    pub async fn set_queue(&self, queue: impl Into<String>) -> BrokerResult<()> {
        let queue = queue.into();
        if queue.trim().is_empty() {
            return Err(ConfigError::EmptyQueue.into());
        }
        if *self.queue.lock() == queue {
            return Ok(());
        }
        if self.is_active() {
            self.stop().await?;
        }
        *self.queue.lock() = queue;
        Ok(())
    }

    /// Subscribe and block the calling task dispatching deliveries to
    /// `handler` until [`stop`](Self::stop) is called from another task or
    /// the connection fails.
    ///
    /// While already active, `restart_if_running = false` makes this a
    /// no-op; `true` stops the current subscription and starts fresh. The
    /// queue is declared durable and prefetch is pinned to 1 so one slow
    /// consumer cannot hold more than a single unacknowledged delivery.
    pub async fn subscribe(
        &self,
        handler: Arc<dyn MessageHandler>,
        auto_ack: bool,
        restart_if_running: bool,
    ) -> BrokerResult<()> {
        if self.is_active() {
            if !restart_if_running {
                tracing::debug!("Subscription already active; leaving it running");
                return Ok(());
            }
            self.stop().await?;
        }

        let channel = self.manager.channel()?;
        let queue = self.queue();
        channel.declare_queue(&queue, true).await?;
        channel.set_prefetch(1).await?;
        let (tag, mut stream) = channel.consume(&queue, auto_ack).await?;

        let sub = Arc::new(ActiveSub {
            consumer_tag: tag.clone(),
            channel: channel.clone(),
            cancelling: AtomicBool::new(false),
        });
        *self.active.lock() = Some(sub.clone());
        tracing::info!(queue = %queue, consumer_tag = %tag, "Consuming messages");

        let mut stragglers = Vec::new();
        let mut stream_error = None;
        while let Some(item) = stream.next().await {
            match item {
                Ok(delivery) => {
                    if sub.cancelling.load(Ordering::SeqCst) {
                        // in flight between the cancel request and CancelOk
                        if !auto_ack {
                            stragglers.push(delivery);
                        }
                    } else {
                        handler.handle(delivery).await;
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, queue = %queue, "Consume stream failed");
                    stream_error = Some(e);
                    break;
                }
            }
        }

        if !stragglers.is_empty() {
            tracing::warn!(
                count = stragglers.len(),
                "Handing post-cancel deliveries to the unacknowledged-message handler"
            );
            self.unacked.handle_unacknowledged(stragglers).await;
        }

        self.clear_if_current(&sub);
        tracing::info!(queue = %queue, "Subscription finished");
        match stream_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Cancel the active subscription, if any.
    ///
    /// Idempotent; with no active subscription this performs zero broker
    /// calls. Returns only after the broker confirms the cancellation. Any
    /// unacknowledged deliveries handed back with the cancel go to the
    /// unacknowledged-message handler before the subscription handle is
    /// cleared.
    pub async fn stop(&self) -> BrokerResult<()> {
        let sub = match self.active.lock().as_ref() {
            Some(sub) => sub.clone(),
            None => {
                tracing::debug!("No active subscription to stop");
                return Ok(());
            }
        };
        if sub.cancelling.swap(true, Ordering::SeqCst) {
            // another task is already cancelling this subscription
            return Ok(());
        }

        tracing::info!(consumer_tag = %sub.consumer_tag, "Cancelling subscription");
        let pending = match sub.channel.cancel(&sub.consumer_tag).await {
            Ok(pending) => pending,
            Err(e) => {
                tracing::error!(
                    error = %e,
                    consumer_tag = %sub.consumer_tag,
                    "Failed to cancel subscription"
                );
                self.clear_if_current(&sub);
                return Err(e);
            }
        };

        if !pending.is_empty() {
            tracing::warn!(
                count = pending.len(),
                "Handing unacknowledged deliveries to the unacknowledged-message handler"
            );
            self.unacked.handle_unacknowledged(pending).await;
        }

        self.clear_if_current(&sub);
        Ok(())
    }

    /// Run `f`, then always stop the subscription and disconnect the
    /// manager, on success and error paths alike. Teardown failures are
    /// logged, never raised.
    pub async fn scoped<'a, F, Fut, T>(&'a self, f: F) -> BrokerResult<T>
    where
        F: FnOnce(&'a Subscriber) -> Fut,
        Fut: Future<Output = BrokerResult<T>> + 'a,
    {
        let result = f(self).await;
        if let Err(e) = self.stop().await {
            tracing::warn!(error = %e, "Error stopping subscription during scoped teardown");
        }
        self.manager.disconnect().await;
        result
    }

    fn clear_if_current(&self, sub: &Arc<ActiveSub>) {
        let mut active = self.active.lock();
        let is_current = active
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, sub));
        if is_current {
            *active = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::error::BrokerError;
    use crate::transport::MemoryBroker;
    use std::time::Duration;

    struct DropHandler;

    #[async_trait]
    impl MessageHandler for DropHandler {
        async fn handle(&self, _delivery: Delivery) {}
    }

    async fn connected(broker: &MemoryBroker) -> Arc<ConnectionManager> {
        let config =
            ConnectionConfig::new("localhost", 5672, 1, Duration::from_millis(10)).unwrap();
        let manager = Arc::new(ConnectionManager::new(config, broker.connector()));
        assert!(manager.connect().await);
        manager
    }

    #[tokio::test]
    async fn test_empty_queue_rejected() {
        let broker = MemoryBroker::new();
        let manager = connected(&broker).await;
        assert!(matches!(
            Subscriber::new(manager, "  "),
            Err(ConfigError::EmptyQueue)
        ));
    }

    #[tokio::test]
    async fn test_subscribe_requires_connection() {
        let broker = MemoryBroker::new();
        let config =
            ConnectionConfig::new("localhost", 5672, 1, Duration::from_millis(10)).unwrap();
        let manager = Arc::new(ConnectionManager::new(config, broker.connector()));
        let subscriber = Subscriber::new(manager, "jobs").unwrap();

        let err = subscriber
            .subscribe(Arc::new(DropHandler), false, true)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::NotConnected));
        assert_eq!(broker.consume_calls(), 0);
    }

    #[tokio::test]
    async fn test_stop_without_subscription_is_a_no_op() {
        let broker = MemoryBroker::new();
        let manager = connected(&broker).await;
        let subscriber = Subscriber::new(manager, "jobs").unwrap();

        subscriber.stop().await.unwrap();
        assert_eq!(broker.cancel_calls(), 0);
    }

    #[tokio::test]
    async fn test_set_queue_while_idle() {
        let broker = MemoryBroker::new();
        let manager = connected(&broker).await;
        let subscriber = Subscriber::new(manager, "jobs").unwrap();

        // same value: nothing happens
        subscriber.set_queue("jobs").await.unwrap();
        assert_eq!(subscriber.queue(), "jobs");
        assert_eq!(broker.cancel_calls(), 0);

        // different value while idle: pure field update
        subscriber.set_queue("other").await.unwrap();
        assert_eq!(subscriber.queue(), "other");
        assert_eq!(broker.cancel_calls(), 0);

        let err = subscriber.set_queue("").await.unwrap_err();
        assert!(matches!(
            err,
            BrokerError::Config(ConfigError::EmptyQueue)
        ));
        assert_eq!(subscriber.queue(), "other");
    }
}
