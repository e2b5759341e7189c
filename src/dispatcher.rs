// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Dispatcher
//!
//! The dispatcher subscribes to a queue and processes deliveries one at a
//! time on the calling task until the subscription ends, fails, or is
//! cancelled. With the default prefetch of one, a slow handler never has more
//! than one unacknowledged delivery buffered.
//!
//! A session moves through [`ConsumerState`]:
//! `Idle → Subscribing → Consuming → Cancelled | Faulted`. The terminal state
//! stays visible until the next `consume_blocking` call claims the dispatcher
//! again. Only one session runs per dispatcher; a call made while another is
//! subscribing or consuming fails with `AmqpError::ConsumerError`.
//! Reconnecting after a fault is left to the caller.

use crate::{
    channel::BrokerChannel,
    connection::ReadinessProbe,
    consumer::{consume, AckPolicy},
    errors::{AmqpError, HandlerError},
    handler::{ConsumerHandler, FnHandler},
    otel::CONSUMER_TRACER,
};
use futures_util::StreamExt;
use opentelemetry::global::{self, BoxedTracer};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Lifecycle of a consumer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// No session is running
    Idle,
    /// A session claimed the dispatcher and is setting up the subscription
    Subscribing,
    /// Deliveries are being processed
    Consuming,
    /// The session ended on request or because the broker closed the stream
    Cancelled,
    /// The subscription could not be set up or the stream failed
    Faulted,
}

/// Settings of a [`RabbitMQDispatcher`].
///
/// Defaults to a prefetch of one, [`AckPolicy::AckOnSuccessElseDeadLetter`]
/// and a random `consumer-<uuid>` tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherOptions {
    pub prefetch: u16,
    pub ack_policy: AckPolicy,
    pub consumer_tag: String,
    pub readiness: ReadinessProbe,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        DispatcherOptions {
            prefetch: 1,
            ack_policy: AckPolicy::default(),
            consumer_tag: format!("consumer-{}", Uuid::new_v4()),
            readiness: ReadinessProbe::default(),
        }
    }
}

impl DispatcherOptions {
    /// Sets how failed deliveries are settled.
    ///
    /// # Parameters
    /// * `policy` - The ack policy
    ///
    /// # Returns
    /// Self for method chaining
    pub fn ack_policy(mut self, policy: AckPolicy) -> Self {
        self.ack_policy = policy;
        self
    }

    /// Sets how many unacknowledged deliveries the broker may push.
    ///
    /// # Parameters
    /// * `prefetch` - The basic.qos prefetch count
    ///
    /// # Returns
    /// Self for method chaining
    pub fn prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Sets how long to wait for the channel before giving up.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn readiness(mut self, readiness: ReadinessProbe) -> Self {
        self.readiness = readiness;
        self
    }
}

/// Consumer of a single queue over a [`BrokerChannel`].
pub struct RabbitMQDispatcher {
    channel: Arc<dyn BrokerChannel>,
    options: DispatcherOptions,
    tracer: BoxedTracer,
    state: watch::Sender<ConsumerState>,
    shutdown: watch::Sender<bool>,
}

impl RabbitMQDispatcher {
    /// Creates a new dispatcher in the `Idle` state.
    ///
    /// # Parameters
    /// * `channel` - The channel deliveries are consumed from
    /// * `options` - Prefetch, ack policy, consumer tag and readiness budget
    ///
    /// # Returns
    /// A new RabbitMQDispatcher instance
    pub fn new(channel: Arc<dyn BrokerChannel>, options: DispatcherOptions) -> Self {
        RabbitMQDispatcher {
            channel,
            options,
            tracer: global::tracer(CONSUMER_TRACER),
            state: watch::Sender::new(ConsumerState::Idle),
            shutdown: watch::Sender::new(false),
        }
    }

    /// Current state of the consumer session.
    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    /// Receiver notified on every state transition.
    pub fn watch_state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    /// Stops a running session after the delivery in progress is settled.
    pub fn cancel(&self) {
        self.shutdown.send_replace(true);
    }

    /// Consumes `queue`, handing each decoded body to `callback`.
    ///
    /// Shorthand for [`RabbitMQDispatcher::consume_blocking`] with a
    /// [`FnHandler`].
    ///
    /// # Parameters
    /// * `queue` - The queue to consume from
    /// * `callback` - Called with the JSON body of every delivery
    ///
    /// # Returns
    /// Same as `consume_blocking`
    pub async fn start<F>(&self, queue: &str, callback: F) -> Result<(), AmqpError>
    where
        F: Fn(Value) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.consume_blocking(queue, Arc::new(FnHandler::new(callback)))
            .await
    }

    /// Consumes messages from a single queue in a blocking manner.
    ///
    /// Waits for the channel within the readiness budget, sets the prefetch,
    /// subscribes and then processes deliveries one at a time on the calling
    /// task. Each delivery is settled according to the ack policy; a failing
    /// handler never ends the session.
    ///
    /// # Parameters
    /// * `queue` - The queue to consume from
    /// * `handler` - The handler receiving every decoded delivery
    ///
    /// # Returns
    /// Ok(()) when the session was cancelled or the broker ended the stream.
    /// `AmqpError::NotConnected` when the channel never became ready,
    /// `AmqpError::ConsumerError` when another session is running, or the
    /// subscription/stream error that faulted the session.
    pub async fn consume_blocking(
        &self,
        queue: &str,
        handler: Arc<dyn ConsumerHandler>,
    ) -> Result<(), AmqpError> {
        // claimed before the first await so two callers cannot both subscribe
        let claimed = self.state.send_if_modified(|state| match state {
            ConsumerState::Subscribing | ConsumerState::Consuming => false,
            _ => {
                *state = ConsumerState::Subscribing;
                true
            }
        });

        if !claimed {
            error!(queue, "consumer session already running");
            return Err(AmqpError::ConsumerError(format!(
                "consumer already running on `{queue}`"
            )));
        }

        self.shutdown.send_replace(false);

        let channel = self.channel.clone();
        if !self.options.readiness.wait_for(|| channel.is_open()).await {
            error!(queue, "channel is not open, cannot consume");
            self.set_state(ConsumerState::Idle);
            return Err(AmqpError::NotConnected);
        }

        let tag = self.options.consumer_tag.as_str();

        if let Err(err) = self.channel.basic_qos(self.options.prefetch).await {
            self.set_state(ConsumerState::Faulted);
            return Err(err);
        }

        let mut deliveries = match self.channel.basic_consume(queue, tag).await {
            Ok(stream) => stream,
            Err(err) => {
                self.set_state(ConsumerState::Faulted);
                return Err(err);
            }
        };

        let mut shutdown = self.shutdown.subscribe();
        self.set_state(ConsumerState::Consuming);
        debug!(queue, consumer_tag = tag, "consuming");

        loop {
            let stop = *shutdown.borrow_and_update();
            if stop {
                debug!(queue, consumer_tag = tag, "consumer cancelled");
                self.cancel_subscription(tag).await;
                self.set_state(ConsumerState::Cancelled);
                return Ok(());
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        warn!(queue, "shutdown signal dropped");
                    }
                }
                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => {
                        match consume(
                            &self.tracer,
                            delivery,
                            queue,
                            handler.as_ref(),
                            self.options.ack_policy,
                        )
                        .await
                        {
                            Ok(outcome) => debug!(
                                delivery_tag = outcome.delivery_tag,
                                settlement = ?outcome.settlement,
                                failed = outcome.error.is_some(),
                                "delivery settled"
                            ),
                            Err(err) => error!(error = err.to_string(), "error consume msg"),
                        }
                    }
                    Some(Err(err)) => {
                        error!(error = err.to_string(), queue, "consumer stream failed");
                        self.cancel_subscription(tag).await;
                        self.set_state(ConsumerState::Faulted);
                        return Err(err);
                    }
                    None => {
                        debug!(queue, consumer_tag = tag, "consumer stream ended");
                        self.set_state(ConsumerState::Cancelled);
                        return Ok(());
                    }
                },
            }
        }
    }

    async fn cancel_subscription(&self, tag: &str) {
        if let Err(err) = self.channel.basic_cancel(tag).await {
            warn!(error = err.to_string(), consumer_tag = tag, "failure to cancel consumer");
        }
    }

    fn set_state(&self, state: ConsumerState) {
        self.state.send_replace(state);
    }
}
