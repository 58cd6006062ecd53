//! End-to-end client behavior against the in-process transport.

use amqp_service_kit::{
    extract_session_id, BrokerError, ConnectionConfig, ConnectionManager, Delivery,
    DeliveryMode, InMemorySessionStore, MessageEnvelope, MessageHandler, MemoryBroker,
    Publisher, SessionCorrelator, SessionState, SessionStore, Subscriber, UnackedHandler,
};
use async_trait::async_trait;
use serde_json::json;
use tokio_test::assert_ok;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn test_config() -> ConnectionConfig {
    ConnectionConfig::new("localhost", 5672, 1, Duration::from_millis(10)).unwrap()
}

async fn connected_manager(broker: &MemoryBroker) -> Arc<ConnectionManager> {
    let manager = Arc::new(ConnectionManager::new(test_config(), broker.connector()));
    assert!(manager.connect().await);
    manager
}

/// Poll until `predicate` holds, panicking after two seconds.
async fn wait_until(predicate: impl Fn() -> bool) {
    for _ in 0..200 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within two seconds");
}

#[derive(Default)]
struct RecordingHandler {
    bodies: Mutex<Vec<Vec<u8>>>,
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(&self, delivery: Delivery) {
        self.bodies.lock().unwrap().push(delivery.body.clone());
        delivery.ack().await.unwrap();
    }
}

#[derive(Default)]
struct RecordingUnacked {
    bodies: Mutex<Vec<Vec<u8>>>,
}

#[async_trait]
impl UnackedHandler for RecordingUnacked {
    async fn handle_unacknowledged(&self, deliveries: Vec<Delivery>) {
        let mut bodies = self.bodies.lock().unwrap();
        for delivery in deliveries {
            bodies.push(delivery.body.clone());
        }
    }
}

#[tokio::test]
async fn test_subscribe_dispatches_and_acknowledges() {
    init_tracing();
    let broker = MemoryBroker::new();
    let manager = connected_manager(&broker).await;
    let subscriber = Arc::new(Subscriber::new(manager, "jobs").unwrap());
    let handler = Arc::new(RecordingHandler::default());

    let worker = tokio::spawn({
        let subscriber = subscriber.clone();
        let handler = handler.clone();
        async move { subscriber.subscribe(handler, false, true).await }
    });

    {
        let subscriber = subscriber.clone();
        wait_until(move || subscriber.is_active()).await;
    }

    // the subscription declared the queue durable and pinned prefetch to 1
    assert_eq!(broker.declared_queues(), vec![("jobs".to_string(), true)]);
    assert_eq!(broker.prefetch(), Some(1));

    assert!(broker.push_delivery(b"first", "jobs", None));
    assert!(broker.push_delivery(b"second", "jobs", None));

    {
        let handler = handler.clone();
        wait_until(move || handler.bodies.lock().unwrap().len() == 2).await;
    }
    assert_eq!(broker.ack_count(), 2);

    subscriber.stop().await.unwrap();
    assert_eq!(broker.cancel_calls(), 1);
    worker.await.unwrap().unwrap();
    assert!(!subscriber.is_active());
}

#[tokio::test]
async fn test_stop_is_idempotent_across_tasks() {
    let broker = MemoryBroker::new();
    let manager = connected_manager(&broker).await;
    let subscriber = Arc::new(Subscriber::new(manager, "jobs").unwrap());

    let worker = tokio::spawn({
        let subscriber = subscriber.clone();
        async move {
            subscriber
                .subscribe(Arc::new(RecordingHandler::default()), false, true)
                .await
        }
    });
    {
        let subscriber = subscriber.clone();
        wait_until(move || subscriber.is_active()).await;
    }

    tokio_test::assert_ok!(subscriber.stop().await);
    tokio_test::assert_ok!(subscriber.stop().await);
    assert_eq!(broker.cancel_calls(), 1);
    worker.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_subscribe_again_without_restart_is_a_no_op() {
    let broker = MemoryBroker::new();
    let manager = connected_manager(&broker).await;
    let subscriber = Arc::new(Subscriber::new(manager, "jobs").unwrap());

    let worker = tokio::spawn({
        let subscriber = subscriber.clone();
        async move {
            subscriber
                .subscribe(Arc::new(RecordingHandler::default()), false, true)
                .await
        }
    });
    {
        let subscriber = subscriber.clone();
        wait_until(move || subscriber.is_active()).await;
    }

    subscriber
        .subscribe(Arc::new(RecordingHandler::default()), false, false)
        .await
        .unwrap();

    assert_eq!(broker.consume_calls(), 1);
    assert_eq!(broker.cancel_calls(), 0);

    subscriber.stop().await.unwrap();
    worker.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_subscribe_again_with_restart_replaces_subscription() {
    let broker = MemoryBroker::new();
    let manager = connected_manager(&broker).await;
    let subscriber = Arc::new(Subscriber::new(manager, "jobs").unwrap());

    let first = tokio::spawn({
        let subscriber = subscriber.clone();
        async move {
            subscriber
                .subscribe(Arc::new(RecordingHandler::default()), false, true)
                .await
        }
    });
    {
        let subscriber = subscriber.clone();
        wait_until(move || subscriber.is_active()).await;
    }

    let second = tokio::spawn({
        let subscriber = subscriber.clone();
        async move {
            subscriber
                .subscribe(Arc::new(RecordingHandler::default()), false, true)
                .await
        }
    });

    let broker_probe = broker.clone();
    wait_until(move || broker_probe.consume_calls() == 2).await;
    assert_eq!(broker.cancel_calls(), 1);

    // the first receive loop ended cleanly when its consumer was cancelled
    first.await.unwrap().unwrap();
    assert!(subscriber.is_active());

    subscriber.stop().await.unwrap();
    second.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_stop_hands_unacked_deliveries_to_handler() {
    let broker = MemoryBroker::new();
    let manager = connected_manager(&broker).await;
    let unacked = Arc::new(RecordingUnacked::default());
    let subscriber = Arc::new(
        Subscriber::new(manager, "jobs")
            .unwrap()
            .with_unacked_handler(unacked.clone()),
    );

    let worker = tokio::spawn({
        let subscriber = subscriber.clone();
        async move {
            subscriber
                .subscribe(Arc::new(RecordingHandler::default()), false, true)
                .await
        }
    });
    {
        let subscriber = subscriber.clone();
        wait_until(move || subscriber.is_active()).await;
    }

    broker.queue_pending_on_cancel(b"in-flight", "jobs", None);
    subscriber.stop().await.unwrap();

    assert_eq!(
        *unacked.bodies.lock().unwrap(),
        vec![b"in-flight".to_vec()]
    );
    worker.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_stop_without_pending_skips_unacked_handler() {
    let broker = MemoryBroker::new();
    let manager = connected_manager(&broker).await;
    let unacked = Arc::new(RecordingUnacked::default());
    let subscriber = Arc::new(
        Subscriber::new(manager, "jobs")
            .unwrap()
            .with_unacked_handler(unacked.clone()),
    );

    let worker = tokio::spawn({
        let subscriber = subscriber.clone();
        async move {
            subscriber
                .subscribe(Arc::new(RecordingHandler::default()), false, true)
                .await
        }
    });
    {
        let subscriber = subscriber.clone();
        wait_until(move || subscriber.is_active()).await;
    }

    subscriber.stop().await.unwrap();
    assert!(unacked.bodies.lock().unwrap().is_empty());
    worker.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_queue_change_while_active_stops_exactly_once() {
    let broker = MemoryBroker::new();
    let manager = connected_manager(&broker).await;
    let subscriber = Arc::new(Subscriber::new(manager, "jobs").unwrap());

    let worker = tokio::spawn({
        let subscriber = subscriber.clone();
        async move {
            subscriber
                .subscribe(Arc::new(RecordingHandler::default()), false, true)
                .await
        }
    });
    {
        let subscriber = subscriber.clone();
        wait_until(move || subscriber.is_active()).await;
    }

    // same value: zero stops, still subscribed
    subscriber.set_queue("jobs").await.unwrap();
    assert_eq!(broker.cancel_calls(), 0);
    assert!(subscriber.is_active());

    // different value: exactly one stop before the field updates
    subscriber.set_queue("other").await.unwrap();
    assert_eq!(broker.cancel_calls(), 1);
    assert_eq!(subscriber.queue(), "other");

    worker.await.unwrap().unwrap();
    assert!(!subscriber.is_active());
}

#[tokio::test]
async fn test_scoped_tears_down_on_success_and_error() {
    let broker = MemoryBroker::new();
    let manager = connected_manager(&broker).await;
    let subscriber = Subscriber::new(manager.clone(), "jobs").unwrap();

    let value = subscriber
        .scoped(|_| async { Ok(42) })
        .await
        .unwrap();
    assert_eq!(value, 42);
    assert!(!manager.is_ready());
    assert_eq!(broker.close_calls(), 1);

    // error path on a fresh connection still tears down
    let broker = MemoryBroker::new();
    let manager = connected_manager(&broker).await;
    let subscriber = Subscriber::new(manager.clone(), "jobs").unwrap();

    let err = subscriber
        .scoped(|_| async { Err::<(), _>(BrokerError::Consume("boom".to_string())) })
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Consume(_)));
    assert!(!manager.is_ready());
    assert_eq!(broker.close_calls(), 1);
}

#[tokio::test]
async fn test_publish_and_correlate_session_state() {
    let broker = MemoryBroker::new();
    let manager = connected_manager(&broker).await;
    let publisher = Publisher::new(manager.clone());

    publisher
        .publish(
            &MessageEnvelope::new(b"what is the weather".to_vec(), "asr.text")
                .with_session_id("sess-42"),
        )
        .await
        .unwrap();

    let published = broker.published();
    assert_eq!(published[0].mode, DeliveryMode::Persistent);
    let headers = published[0].headers.clone().unwrap();
    assert_eq!(headers.get("session_id"), Some(&json!("sess-42")));

    // consume it back and thread state through the correlator
    let store = Arc::new(InMemorySessionStore::new());
    let correlator = Arc::new(SessionCorrelator::new(store.clone()));

    struct CorrelatingHandler {
        correlator: Arc<SessionCorrelator>,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MessageHandler for CorrelatingHandler {
        async fn handle(&self, delivery: Delivery) {
            if let Some((key, mut state)) =
                self.correlator.state_for(&delivery.properties).await.unwrap()
            {
                let turns = state.get("turns").and_then(|v| v.as_i64()).unwrap_or(0);
                state.insert("turns".to_string(), json!(turns + 1));
                self.correlator.save(&key, state).await.unwrap();
                self.seen.lock().unwrap().push(key);
            }
            delivery.ack().await.unwrap();
        }
    }

    let handler = Arc::new(CorrelatingHandler {
        correlator,
        seen: Mutex::new(Vec::new()),
    });
    let subscriber = Arc::new(Subscriber::new(manager, "asr.text").unwrap());

    let worker = tokio::spawn({
        let subscriber = subscriber.clone();
        let handler = handler.clone();
        async move { subscriber.subscribe(handler, false, true).await }
    });
    {
        let subscriber = subscriber.clone();
        wait_until(move || subscriber.is_active()).await;
    }

    let mut headers = HashMap::new();
    headers.insert("session_id".to_string(), json!("sess-42"));
    assert!(broker.push_delivery(b"what is the weather", "asr.text", Some(headers.clone())));
    assert!(broker.push_delivery(b"and tomorrow", "asr.text", Some(headers)));

    {
        let handler = handler.clone();
        wait_until(move || handler.seen.lock().unwrap().len() == 2).await;
    }

    let state: SessionState = store.retrieve("sess-42").await.unwrap();
    assert_eq!(state.get("turns"), Some(&json!(2)));

    subscriber.stop().await.unwrap();
    worker.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_headerless_delivery_is_a_normal_no_session_case() {
    let properties = amqp_service_kit::MessageProperties { headers: None };
    assert_eq!(extract_session_id(&properties), None);
}

#[tokio::test]
async fn test_connect_failure_flow_marks_service_unready() {
    // the owning-service pattern: connect() == false is not an error, the
    // caller links it to the health surface
    let broker = MemoryBroker::new();
    broker.fail_next_connects(u32::MAX);
    let config = ConnectionConfig::new("localhost", 5672, 2, Duration::from_millis(1)).unwrap();
    let manager = ConnectionManager::new(config, broker.connector());

    let health = amqp_service_kit::HealthServer::disabled();
    health.set_ready(false);

    if manager.connect().await {
        health.set_ready(true);
    }
    assert!(!health.ready());
    assert_eq!(broker.connect_calls(), 2);
}
