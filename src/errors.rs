// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the RabbitMQ Facade
//!
//! `AmqpError` covers every broker-facing failure: connection and channel
//! lifecycle, topology declaration, publishing and consuming. Failures raised
//! while processing a single delivery are kept apart in `ProcessingError` so
//! that a consumer can decide how to settle the message instead of losing the
//! signal.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Configuration could not be loaded
    #[error("failure to load configuration `{0}`")]
    ConfigError(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    /// Error creating or configuring a channel
    #[error("failure to create a channel `{0}`")]
    ChannelError(String),

    /// The connection or channel did not become ready within the probe budget
    #[error("not connected")]
    NotConnected,

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error publishing a message
    #[error("failure to publish `{0}`")]
    PublishingError(String),

    /// The broker accepted a mandatory publish but no queue was bound to receive it
    #[error("unroutable message on exchange `{exchange}` with key `{routing_key}`: {reason}")]
    UnroutableError {
        exchange: String,
        routing_key: String,
        reason: String,
    },

    /// The broker negatively confirmed a publish
    #[error("publish to exchange `{0}` was nacked by the broker")]
    PublishNacked(String),

    /// Error serializing a payload before publishing
    #[error("failure to serialize payload `{0}`")]
    SerializePayloadError(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a consumer
    #[error("consumer declaration error `{0}`")]
    ConsumerDeclarationError(String),

    /// Error cancelling a consumer
    #[error("failure to cancel consumer `{0}`")]
    ConsumerCancelError(String),

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),
}

/// Failure while turning a delivery into work: either the payload could not
/// be decoded or the handler rejected it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessingError {
    #[error("failure to decode payload `{0}`")]
    Decode(String),

    #[error("handler failure `{0}`")]
    Handler(String),
}

/// Error returned by consumer callbacks.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(msg: impl Into<String>) -> Self {
        HandlerError(msg.into())
    }
}

impl From<HandlerError> for ProcessingError {
    fn from(err: HandlerError) -> Self {
        ProcessingError::Handler(err.0)
    }
}
