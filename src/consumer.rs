// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Processing
//!
//! Each delivery is decoded (UTF-8, then JSON), handed to the handler and
//! settled exactly once. How a failed delivery is settled is the caller's
//! choice through [`AckPolicy`]; the failure itself is always returned in the
//! [`DispatchOutcome`] and recorded on the consumer span.

use crate::{
    channel::IncomingDelivery,
    errors::{AmqpError, ProcessingError},
    handler::{ConsumerHandler, ConsumerMessage},
    otel,
};
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
};
use serde_json::Value;
use tracing::{debug, error, warn};

/// How a delivery whose processing failed is settled. Successful deliveries
/// are always acknowledged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AckPolicy {
    /// Acknowledge regardless of the outcome (at-most-once).
    AlwaysAck,
    /// Nack with requeue so the delivery is retried (at-least-once; handlers
    /// must be idempotent).
    AckOnSuccessElseRequeue,
    /// Nack without requeue; the broker moves the delivery to the queue's
    /// dead letter exchange, or drops it when none is configured.
    #[default]
    AckOnSuccessElseDeadLetter,
}

/// Broker-side settlement applied to a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    /// Nack with requeue
    Requeue,
    /// Nack without requeue
    DeadLetter,
}

impl AckPolicy {
    /// Settlement applied to a delivery whose processing produced `result`.
    pub fn settlement_for(&self, result: &Result<(), ProcessingError>) -> Settlement {
        match (self, result) {
            (_, Ok(())) => Settlement::Ack,
            (AckPolicy::AlwaysAck, Err(_)) => Settlement::Ack,
            (AckPolicy::AckOnSuccessElseRequeue, Err(_)) => Settlement::Requeue,
            (AckPolicy::AckOnSuccessElseDeadLetter, Err(_)) => Settlement::DeadLetter,
        }
    }
}

/// What happened to a single delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub delivery_tag: u64,
    pub settlement: Settlement,
    pub error: Option<ProcessingError>,
}

pub(crate) fn decode(data: &[u8]) -> Result<Value, ProcessingError> {
    let text = std::str::from_utf8(data).map_err(|err| ProcessingError::Decode(err.to_string()))?;
    serde_json::from_str(text).map_err(|err| ProcessingError::Decode(err.to_string()))
}

/// Decodes, handles and settles one delivery.
///
/// The delivery is processed under a consumer span continuing the trace
/// found in its headers. Decode and handler failures are recorded on the span,
/// logged and settled according to `policy`.
///
/// # Parameters
/// * `tracer` - The tracer used to open the consumer span
/// * `delivery` - The delivery to process
/// * `queue` - The queue the delivery came from
/// * `handler` - The handler receiving the decoded message
/// * `policy` - How a failed delivery is settled
///
/// # Returns
/// The outcome of the delivery, or an error only when the ack or nack itself
/// failed
pub(crate) async fn consume(
    tracer: &BoxedTracer,
    delivery: IncomingDelivery,
    queue: &str,
    handler: &dyn ConsumerHandler,
    policy: AckPolicy,
) -> Result<DispatchOutcome, AmqpError> {
    let span_name = delivery.msg_type.clone().unwrap_or_else(|| queue.to_owned());
    let (ctx, mut span) = otel::new_span(&delivery.headers, tracer, &span_name);

    let delivery_tag = delivery.delivery_tag;
    debug!(
        delivery_tag,
        exchange = delivery.exchange,
        routing_key = delivery.routing_key,
        "received message"
    );

    let result = match decode(&delivery.data) {
        Ok(body) => {
            let msg = ConsumerMessage {
                queue: queue.to_owned(),
                delivery_tag,
                exchange: delivery.exchange.clone(),
                routing_key: delivery.routing_key.clone(),
                redelivered: delivery.redelivered,
                msg_type: delivery.msg_type.clone(),
                body,
            };
            handler.exec(&ctx, &msg).await.map_err(ProcessingError::from)
        }
        Err(err) => Err(err),
    };

    let settlement = policy.settlement_for(&result);

    match &result {
        Ok(()) => {
            debug!(delivery_tag, "message successfully processed");
            span.set_status(Status::Ok);
        }
        Err(err) => {
            span.record_error(err);
            span.set_status(Status::error(err.to_string()));

            match settlement {
                Settlement::Ack => warn!(
                    error = err.to_string(),
                    delivery_tag, "failure processing message, acknowledged and removed from queue"
                ),
                Settlement::Requeue => warn!(
                    error = err.to_string(),
                    delivery_tag, "failure processing message, requeuing for later"
                ),
                Settlement::DeadLetter => warn!(
                    error = err.to_string(),
                    delivery_tag, "failure processing message, rejecting to dead letter"
                ),
            }
        }
    }

    let settled = match settlement {
        Settlement::Ack => delivery.ack().await,
        Settlement::Requeue => delivery.nack(true).await,
        Settlement::DeadLetter => delivery.nack(false).await,
    };

    if let Err(err) = settled {
        error!(error = err.to_string(), delivery_tag, "error whiling settling msg");
        span.record_error(&err);
        span.set_status(Status::error("error to settle msg"));
        return Err(err);
    }

    Ok(DispatchOutcome {
        delivery_tag,
        settlement,
        error: result.err(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::MockAcknowledger,
        errors::HandlerError,
        handler::FnHandler,
        otel::CONSUMER_TRACER,
    };
    use opentelemetry::global;
    use std::sync::Arc;

    fn delivery(tag: u64, data: &[u8], acker: MockAcknowledger) -> IncomingDelivery {
        IncomingDelivery::new(tag, data.to_vec(), Arc::new(acker))
            .with_route("orders", "orders-queue")
    }

    fn handler() -> FnHandler<impl Fn(Value) -> Result<(), HandlerError> + Send + Sync> {
        FnHandler::new(|body: Value| {
            if body.get("fail").is_some() {
                Err(HandlerError::new("rejected by handler"))
            } else {
                Ok(())
            }
        })
    }

    #[test]
    fn should_map_results_to_settlements() {
        let failed = Err(ProcessingError::Handler("boom".to_owned()));

        assert_eq!(AckPolicy::AlwaysAck.settlement_for(&failed), Settlement::Ack);
        assert_eq!(
            AckPolicy::AckOnSuccessElseRequeue.settlement_for(&failed),
            Settlement::Requeue
        );
        assert_eq!(
            AckPolicy::AckOnSuccessElseDeadLetter.settlement_for(&failed),
            Settlement::DeadLetter
        );
        for policy in [
            AckPolicy::AlwaysAck,
            AckPolicy::AckOnSuccessElseRequeue,
            AckPolicy::AckOnSuccessElseDeadLetter,
        ] {
            assert_eq!(policy.settlement_for(&Ok(())), Settlement::Ack);
        }
    }

    #[test]
    fn should_reject_non_utf8_and_non_json_payloads() {
        assert!(matches!(decode(&[0xff, 0xfe]), Err(ProcessingError::Decode(_))));
        assert!(matches!(decode(b"not json"), Err(ProcessingError::Decode(_))));
        assert_eq!(decode(b"{\"id\":1}"), Ok(serde_json::json!({"id": 1})));
    }

    #[tokio::test]
    async fn should_ack_processed_messages() {
        let mut acker = MockAcknowledger::new();
        acker.expect_ack().times(1).returning(|| Ok(()));
        acker.expect_nack().never();

        let outcome = consume(
            &global::tracer(CONSUMER_TRACER),
            delivery(4, b"{\"id\":1}", acker),
            "orders-queue",
            &handler(),
            AckPolicy::AckOnSuccessElseRequeue,
        )
        .await;

        assert_eq!(
            outcome,
            Ok(DispatchOutcome {
                delivery_tag: 4,
                settlement: Settlement::Ack,
                error: None,
            })
        );
    }

    #[tokio::test]
    async fn should_report_decode_failures_and_still_settle() {
        let mut acker = MockAcknowledger::new();
        acker
            .expect_nack()
            .withf(|requeue| !*requeue)
            .times(1)
            .returning(|_| Ok(()));

        let outcome = consume(
            &global::tracer(CONSUMER_TRACER),
            delivery(5, b"not json", acker),
            "orders-queue",
            &handler(),
            AckPolicy::AckOnSuccessElseDeadLetter,
        )
        .await
        .unwrap();

        assert_eq!(outcome.settlement, Settlement::DeadLetter);
        assert!(matches!(outcome.error, Some(ProcessingError::Decode(_))));
    }

    #[tokio::test]
    async fn should_return_settlement_failures() {
        let mut acker = MockAcknowledger::new();
        acker
            .expect_ack()
            .times(1)
            .returning(|| Err(AmqpError::AckMessageError));

        let outcome = consume(
            &global::tracer(CONSUMER_TRACER),
            delivery(6, b"{\"fail\":true}", acker),
            "orders-queue",
            &handler(),
            AckPolicy::AlwaysAck,
        )
        .await;

        assert_eq!(outcome, Err(AmqpError::AckMessageError));
    }
}
