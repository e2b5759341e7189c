// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Handlers
//!
//! A handler receives each decoded delivery and reports success or failure;
//! the dispatcher's `AckPolicy` turns that result into an ack or a nack.

use crate::errors::HandlerError;
use async_trait::async_trait;
use opentelemetry::Context;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// A decoded delivery handed to a [`ConsumerHandler`].
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerMessage {
    pub queue: String,
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub msg_type: Option<String>,
    pub body: Value,
}

impl ConsumerMessage {
    /// Deserializes the body into `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        serde_json::from_value(self.body.clone()).map_err(|err| HandlerError(err.to_string()))
    }
}

#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn exec(&self, ctx: &Context, msg: &ConsumerMessage) -> Result<(), HandlerError>;
}

/// Adapts a plain callback over the decoded body into a [`ConsumerHandler`].
pub struct FnHandler<F> {
    callback: F,
}

impl<F> FnHandler<F>
where
    F: Fn(Value) -> Result<(), HandlerError> + Send + Sync,
{
    pub fn new(callback: F) -> Self {
        FnHandler { callback }
    }
}

#[async_trait]
impl<F> ConsumerHandler for FnHandler<F>
where
    F: Fn(Value) -> Result<(), HandlerError> + Send + Sync,
{
    async fn exec(&self, _ctx: &Context, msg: &ConsumerMessage) -> Result<(), HandlerError> {
        (self.callback)(msg.body.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Order {
        id: u64,
    }

    fn message(body: Value) -> ConsumerMessage {
        ConsumerMessage {
            queue: "orders-queue".to_owned(),
            delivery_tag: 1,
            exchange: "orders".to_owned(),
            routing_key: "orders-queue".to_owned(),
            redelivered: false,
            msg_type: None,
            body,
        }
    }

    #[test]
    fn should_decode_typed_bodies() {
        assert_eq!(message(json!({"id": 1})).decode::<Order>(), Ok(Order { id: 1 }));
        assert!(message(json!({"name": "x"})).decode::<Order>().is_err());
    }

    #[tokio::test]
    async fn should_forward_body_to_callback() {
        let handler = FnHandler::new(|body: Value| {
            if body["id"] == 1 {
                Ok(())
            } else {
                Err(HandlerError::new("unexpected order"))
            }
        });

        assert!(handler.exec(&Context::new(), &message(json!({"id": 1}))).await.is_ok());
        assert_eq!(
            handler.exec(&Context::new(), &message(json!({"id": 2}))).await,
            Err(HandlerError::new("unexpected order"))
        );
    }
}
