// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Abstraction
//!
//! Topology, publishing and consuming all go through [`BrokerChannel`], a thin
//! trait over the subset of `lapin::Channel` this crate uses. [`LapinChannel`]
//! is the production implementation; tests substitute a mock.
//!
//! Deliveries are handed out as [`IncomingDelivery`] values whose
//! acknowledgement goes through an [`Acknowledger`], so a delivery can only be
//! settled once: `ack` and `nack` consume it.

use crate::errors::AmqpError;
use async_trait::async_trait;
use futures_util::{stream::BoxStream, StreamExt};
use lapin::{
    acker::Acker,
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties, Channel, ExchangeKind,
};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error};

#[cfg(test)]
use mockall::automock;

/// Stream of deliveries produced by a consumer subscription.
pub type DeliveryStream = BoxStream<'static, Result<IncomingDelivery, AmqpError>>;

/// Broker answer to a confirmed publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishConfirmation {
    /// Routed and confirmed.
    Ack,
    /// Confirmed but returned because no queue matched a mandatory publish.
    Returned { reply_code: u16, reply_text: String },
    /// Refused by the broker.
    Nack,
    /// The channel is not in confirm mode.
    NotRequested,
}

/// Operations the facade needs from an AMQP channel.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Whether the channel (and therefore its connection) is open.
    fn is_open(&self) -> bool;

    async fn exchange_declare(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError>;

    async fn queue_declare(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError>;

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError>;

    /// Publishes and waits for the broker confirmation.
    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: BasicPublishOptions,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<PublishConfirmation, AmqpError>;

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError>;

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError>;

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// Settles a single delivery on the broker.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), AmqpError>;

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError>;
}

/// A message delivered to a consumer.
pub struct IncomingDelivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub msg_type: Option<String>,
    pub headers: BTreeMap<ShortString, AMQPValue>,
    pub data: Vec<u8>,
    acker: Arc<dyn Acknowledger>,
}

impl IncomingDelivery {
    pub fn new(delivery_tag: u64, data: Vec<u8>, acker: Arc<dyn Acknowledger>) -> Self {
        IncomingDelivery {
            delivery_tag,
            exchange: String::new(),
            routing_key: String::new(),
            redelivered: false,
            msg_type: None,
            headers: BTreeMap::default(),
            data,
            acker,
        }
    }

    pub fn with_route(mut self, exchange: &str, routing_key: &str) -> Self {
        self.exchange = exchange.to_owned();
        self.routing_key = routing_key.to_owned();
        self
    }

    pub async fn ack(self) -> Result<(), AmqpError> {
        self.acker.ack().await
    }

    pub async fn nack(self, requeue: bool) -> Result<(), AmqpError> {
        self.acker.nack(requeue).await
    }
}

impl From<Delivery> for IncomingDelivery {
    fn from(delivery: Delivery) -> Self {
        let headers = delivery
            .properties
            .headers()
            .clone()
            .unwrap_or_default()
            .inner()
            .clone();

        IncomingDelivery {
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.to_string(),
            routing_key: delivery.routing_key.to_string(),
            redelivered: delivery.redelivered,
            msg_type: delivery.properties.kind().as_ref().map(|k| k.to_string()),
            headers,
            data: delivery.data,
            acker: Arc::new(LapinAcker(delivery.acker)),
        }
    }
}

struct LapinAcker(Acker);

#[async_trait]
impl Acknowledger for LapinAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.0
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.0
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                AmqpError::NackMessageError
            })
    }
}

/// [`BrokerChannel`] backed by a `lapin` channel.
pub struct LapinChannel {
    channel: Channel,
}

impl LapinChannel {
    pub fn new(channel: Channel) -> Self {
        LapinChannel { channel }
    }

    pub fn id(&self) -> u16 {
        self.channel.id()
    }
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn exchange_declare(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        self.channel
            .exchange_declare(name, kind, options, arguments)
            .await
            .map_err(|err| {
                error!(error = err.to_string(), name, "error to declare the exchange");
                AmqpError::DeclareExchangeError(name.to_owned())
            })
    }

    async fn queue_declare(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        arguments: FieldTable,
    ) -> Result<(), AmqpError> {
        match self.channel.queue_declare(name, options, arguments).await {
            Ok(queue) => {
                debug!(
                    name,
                    messages = queue.message_count(),
                    consumers = queue.consumer_count(),
                    "queue declared"
                );
                Ok(())
            }
            Err(err) => {
                error!(error = err.to_string(), name, "error to declare the queue");
                Err(AmqpError::DeclareQueueError(name.to_owned()))
            }
        }
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), queue, exchange, "error to bind queue to exchange");
                AmqpError::BindingExchangeToQueueError(exchange.to_owned(), queue.to_owned())
            })
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: BasicPublishOptions,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<PublishConfirmation, AmqpError> {
        let confirm = self
            .channel
            .basic_publish(exchange, routing_key, options, payload, properties)
            .await
            .map_err(|err| {
                error!(error = err.to_string(), exchange, "error publishing message");
                AmqpError::PublishingError(err.to_string())
            })?;

        let confirmation = confirm.await.map_err(|err| {
            error!(error = err.to_string(), exchange, "error awaiting publisher confirm");
            AmqpError::PublishingError(err.to_string())
        })?;

        Ok(match confirmation {
            Confirmation::Ack(Some(returned)) | Confirmation::Nack(Some(returned)) => {
                PublishConfirmation::Returned {
                    reply_code: returned.reply_code,
                    reply_text: returned.reply_text.to_string(),
                }
            }
            Confirmation::Ack(None) => PublishConfirmation::Ack,
            Confirmation::Nack(None) => PublishConfirmation::Nack,
            Confirmation::NotRequested => PublishConfirmation::NotRequested,
        })
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), prefetch_count, "error to configure qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), queue, "error to create the consumer");
                AmqpError::ConsumerDeclarationError(queue.to_owned())
            })?;

        Ok(consumer
            .map(|result| {
                result
                    .map(IncomingDelivery::from)
                    .map_err(|err| AmqpError::ConsumerError(err.to_string()))
            })
            .boxed())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions { nowait: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), consumer_tag, "error to cancel the consumer");
                AmqpError::ConsumerCancelError(consumer_tag.to_owned())
            })
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.channel.close(200, "OK").await.map_err(|err| {
            error!(error = err.to_string(), "error to close the channel");
            AmqpError::ChannelError(err.to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn should_settle_through_the_acknowledger() {
        let mut acker = MockAcknowledger::new();
        acker.expect_ack().times(1).returning(|| Ok(()));
        acker.expect_nack().never();

        let delivery = IncomingDelivery::new(7, b"{}".to_vec(), Arc::new(acker))
            .with_route("orders", "orders-queue");

        assert_eq!(delivery.delivery_tag, 7);
        assert_eq!(delivery.routing_key, "orders-queue");
        assert!(delivery.ack().await.is_ok());
    }

    #[tokio::test]
    async fn should_forward_requeue_flag_on_nack() {
        let mut acker = MockAcknowledger::new();
        acker
            .expect_nack()
            .withf(|requeue| *requeue)
            .times(1)
            .returning(|_| Ok(()));

        let delivery = IncomingDelivery::new(1, vec![], Arc::new(acker));

        assert!(delivery.nack(true).await.is_ok());
    }
}
