//! In-process broker transport for tests and local development
//!
//! Records every broker interaction and lets callers script failures
//! (refused connections, publish errors, pending deliveries handed back on
//! cancel), so the client layer can be exercised without a live broker.

use crate::error::{BrokerError, BrokerResult};
use crate::message::{DeliveryMode, MessageProperties};
use crate::transport::{
    BrokerChannel, BrokerConnection, BrokerConnector, Delivery, DeliveryAcker, DeliveryStream,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// A message captured on publish.
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub mode: DeliveryMode,
    pub headers: Option<HashMap<String, Value>>,
}

#[derive(Default)]
struct Core {
    fail_connects_remaining: u32,
    connect_calls: u32,
    close_calls: u32,
    conn_open: Option<Arc<AtomicBool>>,
    chan_open: Option<Arc<AtomicBool>>,
    declared_queues: Vec<(String, bool)>,
    prefetch: Option<u16>,
    published: Vec<PublishedMessage>,
    publish_failure: Option<BrokerError>,
    consume_calls: u32,
    cancel_calls: u32,
    cancelled_tags: Vec<String>,
    pending_on_cancel: Vec<Delivery>,
    delivery_tx: Option<mpsc::UnboundedSender<Delivery>>,
    ack_count: u32,
    nack_count: u32,
}

/// Shared in-process broker. Clone it freely; all clones observe the same
/// state. `connector()` yields the [`BrokerConnector`] to hand to a
/// `ConnectionManager`.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    core: Arc<Mutex<Core>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> Arc<dyn BrokerConnector> {
        Arc::new(MemoryConnector {
            core: self.core.clone(),
        })
    }

    /// Make the next `n` connection attempts fail.
    pub fn fail_next_connects(&self, n: u32) {
        self.core.lock().fail_connects_remaining = n;
    }

    /// Make the next publish fail with `err`.
    pub fn fail_next_publish(&self, err: BrokerError) {
        self.core.lock().publish_failure = Some(err);
    }

    /// Queue deliveries to be handed back by the next consumer cancel.
    pub fn queue_pending_on_cancel(
        &self,
        body: &[u8],
        routing_key: &str,
        headers: Option<HashMap<String, Value>>,
    ) {
        let delivery = self.make_delivery(body, routing_key, headers);
        self.core.lock().pending_on_cancel.push(delivery);
    }

    /// Feed a delivery to the active consumer. Returns false when no
    /// consumer is listening.
    pub fn push_delivery(
        &self,
        body: &[u8],
        routing_key: &str,
        headers: Option<HashMap<String, Value>>,
    ) -> bool {
        let delivery = self.make_delivery(body, routing_key, headers);
        let core = self.core.lock();
        match &core.delivery_tx {
            Some(tx) => tx.send(delivery).is_ok(),
            None => false,
        }
    }

    /// Simulate the broker closing the channel underneath the client.
    pub fn kill_channel(&self) {
        if let Some(flag) = &self.core.lock().chan_open {
            flag.store(false, Ordering::SeqCst);
        }
    }

    /// Simulate the broker closing the connection underneath the client.
    pub fn kill_connection(&self) {
        let core = self.core.lock();
        if let Some(flag) = &core.conn_open {
            flag.store(false, Ordering::SeqCst);
        }
    }

    pub fn connect_calls(&self) -> u32 {
        self.core.lock().connect_calls
    }

    pub fn close_calls(&self) -> u32 {
        self.core.lock().close_calls
    }

    pub fn declared_queues(&self) -> Vec<(String, bool)> {
        self.core.lock().declared_queues.clone()
    }

    pub fn prefetch(&self) -> Option<u16> {
        self.core.lock().prefetch
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.core.lock().published.clone()
    }

    pub fn consume_calls(&self) -> u32 {
        self.core.lock().consume_calls
    }

    pub fn cancel_calls(&self) -> u32 {
        self.core.lock().cancel_calls
    }

    pub fn cancelled_tags(&self) -> Vec<String> {
        self.core.lock().cancelled_tags.clone()
    }

    pub fn ack_count(&self) -> u32 {
        self.core.lock().ack_count
    }

    pub fn nack_count(&self) -> u32 {
        self.core.lock().nack_count
    }

    /// Whether a consumer is currently attached.
    pub fn has_consumer(&self) -> bool {
        self.core.lock().delivery_tx.is_some()
    }

    fn make_delivery(
        &self,
        body: &[u8],
        routing_key: &str,
        headers: Option<HashMap<String, Value>>,
    ) -> Delivery {
        Delivery::new(
            body.to_vec(),
            routing_key.to_string(),
            String::new(),
            false,
            MessageProperties { headers },
            Some(Box::new(MemoryAcker {
                core: self.core.clone(),
            })),
        )
    }
}

struct MemoryConnector {
    core: Arc<Mutex<Core>>,
}

#[async_trait]
impl BrokerConnector for MemoryConnector {
    async fn connect(&self, _host: &str, _port: u16) -> BrokerResult<Box<dyn BrokerConnection>> {
        let mut core = self.core.lock();
        core.connect_calls += 1;
        if core.fail_connects_remaining > 0 {
            core.fail_connects_remaining -= 1;
            return Err(BrokerError::Connection(
                "connection refused (scripted)".to_string(),
            ));
        }
        let open = Arc::new(AtomicBool::new(true));
        core.conn_open = Some(open.clone());
        Ok(Box::new(MemoryConnection {
            core: self.core.clone(),
            open,
        }))
    }
}

struct MemoryConnection {
    core: Arc<Mutex<Core>>,
    open: Arc<AtomicBool>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn open_channel(&self) -> BrokerResult<Arc<dyn BrokerChannel>> {
        if !self.is_open() {
            return Err(BrokerError::Connection("connection is closed".to_string()));
        }
        let chan_open = Arc::new(AtomicBool::new(true));
        let mut core = self.core.lock();
        core.chan_open = Some(chan_open.clone());
        Ok(Arc::new(MemoryChannel {
            core: self.core.clone(),
            conn_open: self.open.clone(),
            open: chan_open,
        }))
    }

    async fn close(&self) -> BrokerResult<()> {
        let mut core = self.core.lock();
        core.close_calls += 1;
        self.open.store(false, Ordering::SeqCst);
        if let Some(flag) = &core.chan_open {
            flag.store(false, Ordering::SeqCst);
        }
        // closing the connection ends any active consumer stream
        core.delivery_tx = None;
        Ok(())
    }
}

struct MemoryChannel {
    core: Arc<Mutex<Core>>,
    conn_open: Arc<AtomicBool>,
    open: Arc<AtomicBool>,
}

impl MemoryChannel {
    fn guard(&self) -> BrokerResult<()> {
        if !self.conn_open.load(Ordering::SeqCst) {
            return Err(BrokerError::Connection("connection is closed".to_string()));
        }
        if !self.open.load(Ordering::SeqCst) {
            return Err(BrokerError::Channel("channel is closed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn declare_queue(&self, queue: &str, durable: bool) -> BrokerResult<()> {
        self.guard()?;
        self.core
            .lock()
            .declared_queues
            .push((queue.to_string(), durable));
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> BrokerResult<()> {
        self.guard()?;
        self.core.lock().prefetch = Some(count);
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        mode: DeliveryMode,
        headers: Option<&HashMap<String, Value>>,
    ) -> BrokerResult<()> {
        self.guard()?;
        let mut core = self.core.lock();
        if let Some(err) = core.publish_failure.take() {
            return Err(err);
        }
        core.published.push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body: body.to_vec(),
            mode,
            headers: headers.cloned(),
        });
        Ok(())
    }

    async fn consume(
        &self,
        _queue: &str,
        _auto_ack: bool,
    ) -> BrokerResult<(String, Box<dyn DeliveryStream>)> {
        self.guard()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut core = self.core.lock();
        core.consume_calls += 1;
        core.delivery_tx = Some(tx);
        let tag = format!("ctag-{}", Uuid::new_v4());
        Ok((tag, Box::new(MemoryDeliveryStream { rx })))
    }

    async fn cancel(&self, consumer_tag: &str) -> BrokerResult<Vec<Delivery>> {
        let mut core = self.core.lock();
        core.cancel_calls += 1;
        core.cancelled_tags.push(consumer_tag.to_string());
        // dropping the sender ends the consumer stream
        core.delivery_tx = None;
        Ok(std::mem::take(&mut core.pending_on_cancel))
    }
}

struct MemoryDeliveryStream {
    rx: mpsc::UnboundedReceiver<Delivery>,
}

#[async_trait]
impl DeliveryStream for MemoryDeliveryStream {
    async fn next(&mut self) -> Option<BrokerResult<Delivery>> {
        self.rx.recv().await.map(Ok)
    }
}

struct MemoryAcker {
    core: Arc<Mutex<Core>>,
}

#[async_trait]
impl DeliveryAcker for MemoryAcker {
    async fn ack(&self) -> BrokerResult<()> {
        self.core.lock().ack_count += 1;
        Ok(())
    }

    async fn nack(&self, _requeue: bool) -> BrokerResult<()> {
        self.core.lock().nack_count += 1;
        Ok(())
    }
}
