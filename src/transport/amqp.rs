//! AMQP transport over `lapin`

use crate::error::{BrokerError, BrokerResult};
use crate::message::{DeliveryMode, MessageProperties};
use crate::transport::{
    BrokerChannel, BrokerConnection, BrokerConnector, Delivery, DeliveryAcker, DeliveryStream,
};
use async_trait::async_trait;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Connects to an AMQP broker (RabbitMQ) through `lapin`.
#[derive(Debug, Default)]
pub struct AmqpConnector;

impl AmqpConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BrokerConnector for AmqpConnector {
    async fn connect(&self, host: &str, port: u16) -> BrokerResult<Box<dyn BrokerConnection>> {
        let uri = format!("amqp://{}:{}", host, port);
        let connection = Connection::connect(&uri, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        Ok(Box::new(AmqpConnection { inner: connection }))
    }
}

struct AmqpConnection {
    inner: Connection,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn open_channel(&self) -> BrokerResult<Arc<dyn BrokerChannel>> {
        let channel = self
            .inner
            .create_channel()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        Ok(Arc::new(AmqpChannel { inner: channel }))
    }

    async fn close(&self) -> BrokerResult<()> {
        self.inner
            .close(200, "Normal shutdown")
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))
    }
}

struct AmqpChannel {
    inner: Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn declare_queue(&self, queue: &str, durable: bool) -> BrokerResult<()> {
        self.inner
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map(|_| ())
            .map_err(classify)
    }

    async fn set_prefetch(&self, count: u16) -> BrokerResult<()> {
        self.inner
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(classify)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        mode: DeliveryMode,
        headers: Option<&HashMap<String, Value>>,
    ) -> BrokerResult<()> {
        let mut properties = BasicProperties::default().with_delivery_mode(mode.as_amqp());
        if let Some(headers) = headers {
            properties = properties.with_headers(to_field_table(headers));
        }

        let confirm = self
            .inner
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                properties,
            )
            .await
            .map_err(classify)?
            .await
            .map_err(classify)?;

        if confirm.is_nack() {
            return Err(BrokerError::Channel(
                "broker refused the publish (nack)".to_string(),
            ));
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        auto_ack: bool,
    ) -> BrokerResult<(String, Box<dyn DeliveryStream>)> {
        let consumer = self
            .inner
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions {
                    no_ack: auto_ack,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(classify)?;

        let tag = consumer.tag().to_string();
        Ok((
            tag,
            Box::new(AmqpDeliveryStream {
                inner: consumer,
                auto_ack,
            }),
        ))
    }

    async fn cancel(&self, consumer_tag: &str) -> BrokerResult<Vec<Delivery>> {
        self.inner
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| BrokerError::Cancel(e.to_string()))?;
        // lapin does not surface pending deliveries on cancel; any in-flight
        // messages drain through the consumer stream before it ends.
        Ok(Vec::new())
    }
}

struct AmqpDeliveryStream {
    inner: Consumer,
    auto_ack: bool,
}

#[async_trait]
impl DeliveryStream for AmqpDeliveryStream {
    async fn next(&mut self) -> Option<BrokerResult<Delivery>> {
        match self.inner.next().await {
            Some(Ok(delivery)) => Some(Ok(convert_delivery(delivery, self.auto_ack))),
            Some(Err(e)) => Some(Err(BrokerError::Consume(e.to_string()))),
            None => None,
        }
    }
}

struct AmqpAcker {
    inner: Acker,
}

#[async_trait]
impl DeliveryAcker for AmqpAcker {
    async fn ack(&self) -> BrokerResult<()> {
        self.inner
            .ack(BasicAckOptions::default())
            .await
            .map_err(classify)
    }

    async fn nack(&self, requeue: bool) -> BrokerResult<()> {
        self.inner
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await
            .map_err(classify)
    }
}

fn convert_delivery(delivery: lapin::message::Delivery, auto_ack: bool) -> Delivery {
    let headers = delivery
        .properties
        .headers()
        .as_ref()
        .map(from_field_table);
    let acker: Option<Box<dyn DeliveryAcker>> = if auto_ack {
        None
    } else {
        Some(Box::new(AmqpAcker {
            inner: delivery.acker,
        }))
    };

    Delivery::new(
        delivery.data,
        delivery.routing_key.to_string(),
        delivery.exchange.to_string(),
        delivery.redelivered,
        MessageProperties { headers },
        acker,
    )
}

/// Sort a lapin failure into the channel or connection side of the taxonomy.
fn classify(err: lapin::Error) -> BrokerError {
    match &err {
        lapin::Error::InvalidChannel(_)
        | lapin::Error::InvalidChannelState(_)
        | lapin::Error::ChannelsLimitReached => BrokerError::Channel(err.to_string()),
        _ => BrokerError::Connection(err.to_string()),
    }
}

fn to_field_table(headers: &HashMap<String, Value>) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        table.insert(key.as_str().into(), to_amqp_value(value));
    }
    table
}

fn to_amqp_value(value: &Value) -> AMQPValue {
    match value {
        Value::Null => AMQPValue::Void,
        Value::Bool(b) => AMQPValue::Boolean(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                AMQPValue::LongLongInt(i)
            } else if let Some(f) = n.as_f64() {
                AMQPValue::Double(f)
            } else {
                AMQPValue::LongString(n.to_string().into())
            }
        }
        Value::String(s) => AMQPValue::LongString(s.clone().into()),
        other => AMQPValue::LongString(other.to_string().into()),
    }
}

fn from_field_table(table: &FieldTable) -> HashMap<String, Value> {
    table
        .inner()
        .iter()
        .map(|(key, value)| (key.as_str().to_string(), from_amqp_value(value)))
        .collect()
}

fn from_amqp_value(value: &AMQPValue) -> Value {
    match value {
        AMQPValue::Boolean(v) => Value::from(*v),
        AMQPValue::ShortShortInt(v) => Value::from(*v),
        AMQPValue::ShortShortUInt(v) => Value::from(*v),
        AMQPValue::ShortInt(v) => Value::from(*v),
        AMQPValue::ShortUInt(v) => Value::from(*v),
        AMQPValue::LongInt(v) => Value::from(*v),
        AMQPValue::LongUInt(v) => Value::from(*v),
        AMQPValue::LongLongInt(v) => Value::from(*v),
        AMQPValue::Float(v) => Value::from(*v),
        AMQPValue::Double(v) => Value::from(*v),
        AMQPValue::ShortString(s) => Value::from(s.as_str()),
        AMQPValue::LongString(s) => {
            Value::from(String::from_utf8_lossy(s.as_bytes()).into_owned())
        }
        AMQPValue::Timestamp(v) => Value::from(*v),
        AMQPValue::Void => Value::Null,
        other => Value::from(format!("{:?}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_header_value_round_trip() {
        let mut headers = HashMap::new();
        headers.insert("session_id".to_string(), json!("abc-123"));
        headers.insert("attempt".to_string(), json!(3));
        headers.insert("sampled".to_string(), json!(true));

        let table = to_field_table(&headers);
        let back = from_field_table(&table);

        assert_eq!(back.get("session_id"), Some(&json!("abc-123")));
        assert_eq!(back.get("attempt"), Some(&json!(3)));
        assert_eq!(back.get("sampled"), Some(&json!(true)));
    }

    #[test]
    fn test_numeric_header_becomes_long_long_int() {
        assert!(matches!(
            to_amqp_value(&json!(1234)),
            AMQPValue::LongLongInt(1234)
        ));
        assert!(matches!(to_amqp_value(&json!(null)), AMQPValue::Void));
    }
}
