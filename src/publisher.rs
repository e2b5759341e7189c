// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! This module publishes messages to RabbitMQ exchanges. Every publish is
//! `mandatory`, persistent and confirmed by the broker, so the caller learns
//! whether the message was routed:
//!
//! - routed and confirmed: `Ok(())`
//! - no queue bound for the routing key: `AmqpError::UnroutableError`
//! - refused by the broker: `AmqpError::PublishNacked`
//! - transport failure: `AmqpError::PublishingError`
//!
//! Publishes made through one [`RabbitMQPublisher`] are serialized so each
//! confirmation belongs to its own publish. The lock is per publisher: share a
//! single publisher (it is handed out as an `Arc`) rather than building several
//! on the same channel.

use crate::{
    channel::{BrokerChannel, PublishConfirmation},
    connection::ReadinessProbe,
    errors::AmqpError,
    otel,
};
use async_trait::async_trait;
use lapin::{
    options::BasicPublishOptions,
    types::{AMQPValue, Boolean, FieldTable, LongLongInt, LongString, LongUInt, ShortString},
    BasicProperties,
};
use opentelemetry::Context;
use serde::Serialize;
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};
use tokio::sync::Mutex;
use tracing::{debug, error};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// AMQP delivery mode of messages that survive a broker restart
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Application header value attached to a published message.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    /// Sent as an AMQP long string
    String(String),
    /// Sent as a signed 64-bit integer
    Int(i64),
    /// Sent as an unsigned 32-bit integer
    UInt(u32),
    Bool(bool),
}

/// A message ready to be published.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishMessage {
    pub exchange: String,
    pub routing_key: Option<String>,
    pub payload: Vec<u8>,
    pub msg_type: Option<String>,
    pub headers: Option<HashMap<String, HeaderValue>>,
}

impl PublishMessage {
    /// Creates a message for `exchange` with an empty routing key.
    ///
    /// # Parameters
    /// * `exchange` - The exchange to publish to
    /// * `payload` - The JSON-encoded body
    ///
    /// # Returns
    /// A new PublishMessage
    pub fn new(exchange: &str, payload: Vec<u8>) -> Self {
        PublishMessage {
            exchange: exchange.to_owned(),
            routing_key: None,
            payload,
            msg_type: None,
            headers: None,
        }
    }

    /// Sets the routing key.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = Some(key.to_owned());
        self
    }

    /// Sets the AMQP `type` property of the message.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn msg_type(mut self, msg_type: &str) -> Self {
        self.msg_type = Some(msg_type.to_owned());
        self
    }

    /// Adds an application header.
    ///
    /// # Parameters
    /// * `key` - The header name
    /// * `value` - The header value
    ///
    /// # Returns
    /// Self for method chaining
    pub fn header(mut self, key: &str, value: HeaderValue) -> Self {
        self.headers
            .get_or_insert_with(HashMap::default)
            .insert(key.to_owned(), value);
        self
    }
}

/// Publishes messages to a broker.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, ctx: &Context, msg: &PublishMessage) -> Result<(), AmqpError>;
}

/// RabbitMQ implementation of the Publisher trait.
pub struct RabbitMQPublisher {
    channel: Arc<dyn BrokerChannel>,
    readiness: ReadinessProbe,
    publish_lock: Mutex<()>,
}

impl RabbitMQPublisher {
    /// Creates a new RabbitMQPublisher.
    ///
    /// # Parameters
    /// * `channel` - The confirm-mode channel to publish on
    /// * `readiness` - How long to wait for the channel before refusing to publish
    ///
    /// # Returns
    /// An Arc-wrapped RabbitMQPublisher instance, meant to be shared
    pub fn new(channel: Arc<dyn BrokerChannel>, readiness: ReadinessProbe) -> Arc<RabbitMQPublisher> {
        Arc::new(RabbitMQPublisher {
            channel,
            readiness,
            publish_lock: Mutex::new(()),
        })
    }

    /// Encodes `message` as JSON and publishes it to `exchange` under the
    /// current trace context.
    ///
    /// # Parameters
    /// * `exchange` - The exchange to publish to
    /// * `message` - Any serializable value
    /// * `routing_key` - The routing key, empty when `None`
    ///
    /// # Returns
    /// `AmqpError::SerializePayloadError` when the value cannot be encoded,
    /// otherwise the result of [`Publisher::publish`]
    pub async fn send<T>(
        &self,
        exchange: &str,
        message: &T,
        routing_key: Option<&str>,
    ) -> Result<(), AmqpError>
    where
        T: Serialize + ?Sized + Sync,
    {
        let payload = serde_json::to_vec(message).map_err(|err| {
            error!(error = err.to_string(), exchange, "error serializing message");
            AmqpError::SerializePayloadError(err.to_string())
        })?;

        let mut msg = PublishMessage::new(exchange, payload);
        if let Some(key) = routing_key {
            msg = msg.routing_key(key);
        }

        self.publish(&Context::current(), &msg).await
    }
}

#[async_trait]
impl Publisher for RabbitMQPublisher {
    /// Publishes a message to RabbitMQ.
    ///
    /// The message is published `mandatory` and persistent, with a JSON
    /// content type, a fresh message id and the trace context of `ctx` in its
    /// headers, and the broker confirmation is awaited before returning.
    ///
    /// # Parameters
    /// * `ctx` - The OpenTelemetry context injected into the headers
    /// * `msg` - The message to publish
    ///
    /// # Returns
    /// Ok(()) once the broker confirmed a routed message.
    /// `AmqpError::UnroutableError` when no queue matched the routing key,
    /// `AmqpError::PublishNacked` when the broker refused it, and
    /// `AmqpError::NotConnected` when the channel never became ready.
    async fn publish(&self, ctx: &Context, msg: &PublishMessage) -> Result<(), AmqpError> {
        let exchange = msg.exchange.as_str();
        let routing_key = msg.routing_key.clone().unwrap_or_default();

        let channel = self.channel.clone();
        if !self.readiness.wait_for(|| channel.is_open()).await {
            error!(exchange, "channel is not open, refusing to publish");
            return Err(AmqpError::NotConnected);
        }

        let mut btree = BTreeMap::<ShortString, AMQPValue>::default();
        otel::inject_context(ctx, &mut btree);

        if let Some(headers) = &msg.headers {
            append_headers(headers, &mut btree);
        }

        let mut properties = BasicProperties::default()
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
            .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_headers(FieldTable::from(btree));

        if let Some(msg_type) = &msg.msg_type {
            properties = properties.with_type(ShortString::from(msg_type.as_str()));
        }

        let confirmation = {
            let _guard = self.publish_lock.lock().await;
            self.channel
                .basic_publish(
                    exchange,
                    &routing_key,
                    BasicPublishOptions {
                        mandatory: true,
                        immediate: false,
                    },
                    &msg.payload,
                    properties,
                )
                .await?
        };

        match confirmation {
            PublishConfirmation::Ack => {
                debug!(exchange, routing_key, "message published");
                Ok(())
            }
            PublishConfirmation::NotRequested => {
                debug!(exchange, routing_key, "message published without confirmation");
                Ok(())
            }
            PublishConfirmation::Returned {
                reply_code,
                reply_text,
            } => {
                error!(
                    exchange,
                    routing_key,
                    reply_code,
                    reason = reply_text,
                    "message could not be routed"
                );
                Err(AmqpError::UnroutableError {
                    exchange: exchange.to_owned(),
                    routing_key,
                    reason: reply_text,
                })
            }
            PublishConfirmation::Nack => {
                error!(exchange, routing_key, "message was nacked by the broker");
                Err(AmqpError::PublishNacked(exchange.to_owned()))
            }
        }
    }
}

fn append_headers(
    headers: &HashMap<String, HeaderValue>,
    btree: &mut BTreeMap<ShortString, AMQPValue>,
) {
    for (key, value) in headers {
        let amqp_value = match value {
            HeaderValue::String(v) => AMQPValue::LongString(LongString::from(v.as_str())),
            HeaderValue::Int(v) => AMQPValue::LongLongInt(LongLongInt::from(*v)),
            HeaderValue::UInt(v) => AMQPValue::LongUInt(LongUInt::from(*v)),
            HeaderValue::Bool(v) => AMQPValue::Boolean(Boolean::from(*v)),
        };

        btree.insert(ShortString::from(key.as_str()), amqp_value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{DeliveryStream, MockBrokerChannel};
    use serde_json::json;
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    fn probe() -> ReadinessProbe {
        ReadinessProbe::new(3, Duration::from_millis(1))
    }

    fn open_channel() -> MockBrokerChannel {
        let mut channel = MockBrokerChannel::new();
        channel.expect_is_open().returning(|| true);
        channel
    }

    #[tokio::test]
    async fn should_publish_mandatory_persistent_json() {
        let mut channel = open_channel();
        channel
            .expect_basic_publish()
            .withf(|exchange, key, opts, payload, props| {
                exchange == "orders"
                    && key == "orders-queue"
                    && opts.mandatory
                    && !opts.immediate
                    && serde_json::from_slice::<serde_json::Value>(payload).ok()
                        == Some(json!({"id": 1}))
                    && props.delivery_mode() == &Some(PERSISTENT_DELIVERY_MODE)
                    && props.content_type() == &Some(ShortString::from(JSON_CONTENT_TYPE))
                    && props.message_id().is_some()
            })
            .times(1)
            .returning(|_, _, _, _, _| Ok(PublishConfirmation::Ack));

        let publisher = RabbitMQPublisher::new(Arc::new(channel), probe());

        let result = publisher
            .send("orders", &json!({"id": 1}), Some("orders-queue"))
            .await;

        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn should_report_unroutable_messages_and_keep_publishing() {
        let mut channel = open_channel();
        channel
            .expect_basic_publish()
            .withf(|_, key, _, _, _| key == "unbound-key")
            .times(1)
            .returning(|_, _, _, _, _| {
                Ok(PublishConfirmation::Returned {
                    reply_code: 312,
                    reply_text: "NO_ROUTE".to_owned(),
                })
            });
        channel
            .expect_basic_publish()
            .withf(|_, key, _, _, _| key == "orders-queue")
            .times(1)
            .returning(|_, _, _, _, _| Ok(PublishConfirmation::Ack));

        let publisher = RabbitMQPublisher::new(Arc::new(channel), probe());

        let unroutable = publisher
            .send("orders", &json!({"id": 1}), Some("unbound-key"))
            .await;
        assert_eq!(
            unroutable,
            Err(AmqpError::UnroutableError {
                exchange: "orders".to_owned(),
                routing_key: "unbound-key".to_owned(),
                reason: "NO_ROUTE".to_owned(),
            })
        );

        let routed = publisher
            .send("orders", &json!({"id": 2}), Some("orders-queue"))
            .await;
        assert!(routed.is_ok());
    }

    #[tokio::test]
    async fn should_report_broker_nacks() {
        let mut channel = open_channel();
        channel
            .expect_basic_publish()
            .returning(|_, _, _, _, _| Ok(PublishConfirmation::Nack));

        let publisher = RabbitMQPublisher::new(Arc::new(channel), probe());

        let result = publisher
            .publish(&Context::new(), &PublishMessage::new("orders", b"{}".to_vec()))
            .await;

        assert_eq!(result, Err(AmqpError::PublishNacked("orders".to_owned())));
    }

    #[tokio::test]
    async fn should_refuse_to_publish_when_not_connected() {
        let mut channel = MockBrokerChannel::new();
        channel.expect_is_open().returning(|| false);
        channel.expect_basic_publish().never();

        let publisher = RabbitMQPublisher::new(Arc::new(channel), probe());

        let result = publisher.send("orders", &json!({"id": 1}), None).await;

        assert_eq!(result, Err(AmqpError::NotConnected));
    }

    #[tokio::test]
    async fn should_propagate_transport_failures() {
        let mut channel = open_channel();
        channel
            .expect_basic_publish()
            .returning(|_, _, _, _, _| Err(AmqpError::PublishingError("socket closed".to_owned())));

        let publisher = RabbitMQPublisher::new(Arc::new(channel), probe());

        let result = publisher.send("orders", &json!({"id": 1}), None).await;

        assert_eq!(
            result,
            Err(AmqpError::PublishingError("socket closed".to_owned()))
        );
    }

    #[tokio::test]
    async fn should_reject_payloads_that_cannot_be_encoded() {
        let mut channel = open_channel();
        channel.expect_basic_publish().never();

        let publisher = RabbitMQPublisher::new(Arc::new(channel), probe());
        let mut invalid = HashMap::new();
        invalid.insert((1, 2), "tuple keys are not valid json keys");

        let result = publisher.send("orders", &invalid, None).await;

        assert!(matches!(result, Err(AmqpError::SerializePayloadError(_))));
    }

    /// Channel whose publishes take a while and which tracks how many of them
    /// run at the same time.
    #[derive(Default)]
    struct SlowChannel {
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        published: AtomicUsize,
    }

    #[async_trait]
    impl BrokerChannel for SlowChannel {
        fn is_open(&self) -> bool {
            true
        }

        async fn exchange_declare(
            &self,
            _name: &str,
            _kind: lapin::ExchangeKind,
            _options: lapin::options::ExchangeDeclareOptions,
            _arguments: FieldTable,
        ) -> Result<(), AmqpError> {
            unreachable!()
        }

        async fn queue_declare(
            &self,
            _name: &str,
            _options: lapin::options::QueueDeclareOptions,
            _arguments: FieldTable,
        ) -> Result<(), AmqpError> {
            unreachable!()
        }

        async fn queue_bind(
            &self,
            _queue: &str,
            _exchange: &str,
            _routing_key: &str,
        ) -> Result<(), AmqpError> {
            unreachable!()
        }

        async fn basic_publish(
            &self,
            _exchange: &str,
            _routing_key: &str,
            _options: BasicPublishOptions,
            _payload: &[u8],
            _properties: BasicProperties,
        ) -> Result<PublishConfirmation, AmqpError> {
            let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(running, Ordering::SeqCst);

            tokio::time::sleep(Duration::from_millis(10)).await;

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.published.fetch_add(1, Ordering::SeqCst);
            Ok(PublishConfirmation::Ack)
        }

        async fn basic_qos(&self, _prefetch_count: u16) -> Result<(), AmqpError> {
            unreachable!()
        }

        async fn basic_consume(
            &self,
            _queue: &str,
            _consumer_tag: &str,
        ) -> Result<DeliveryStream, AmqpError> {
            unreachable!()
        }

        async fn basic_cancel(&self, _consumer_tag: &str) -> Result<(), AmqpError> {
            unreachable!()
        }

        async fn close(&self) -> Result<(), AmqpError> {
            unreachable!()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn should_never_overlap_concurrent_publishes() {
        let channel = Arc::new(SlowChannel::default());
        let publisher = RabbitMQPublisher::new(channel.clone(), probe());

        let tasks = (0..2)
            .map(|task| {
                let publisher = publisher.clone();
                tokio::spawn(async move {
                    for id in 0..5 {
                        publisher
                            .send("orders", &json!({"task": task, "id": id}), Some("orders-queue"))
                            .await
                            .unwrap();
                    }
                })
            })
            .collect::<Vec<_>>();

        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(channel.published.load(Ordering::SeqCst), 10);
        assert_eq!(channel.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn should_attach_type_and_application_headers() {
        let mut channel = open_channel();
        channel
            .expect_basic_publish()
            .withf(|_, _, _, _, props| {
                let headers = props.headers().clone().unwrap_or_default();
                props.kind() == &Some(ShortString::from("order.created"))
                    && headers.inner().get(&ShortString::from("tenant"))
                        == Some(&AMQPValue::LongString(LongString::from("acme")))
                    && headers.inner().get(&ShortString::from("replayed"))
                        == Some(&AMQPValue::Boolean(false))
            })
            .times(1)
            .returning(|_, _, _, _, _| Ok(PublishConfirmation::Ack));

        let publisher = RabbitMQPublisher::new(Arc::new(channel), probe());
        let msg = PublishMessage::new("orders", b"{\"id\":1}".to_vec())
            .routing_key("orders-queue")
            .msg_type("order.created")
            .header("tenant", HeaderValue::String("acme".to_owned()))
            .header("replayed", HeaderValue::Bool(false));

        assert!(publisher.publish(&Context::new(), &msg).await.is_ok());
    }
}
