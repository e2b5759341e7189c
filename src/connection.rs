// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection Management
//!
//! [`ConnectionManager`] owns the connection to RabbitMQ and the single channel
//! shared by the topology, publisher and dispatcher. Connecting retries with a
//! capped exponential backoff, and the channel is put in publisher-confirm mode
//! before it is handed out.
//!
//! Readiness checks are bounded spin-waits ([`ReadinessProbe`]): a `false`
//! answer means "not ready yet", and the wait never exceeds
//! `attempts × interval`.

use crate::{
    channel::{BrokerChannel, LapinChannel},
    config::RabbitMQConfigs,
    errors::AmqpError,
};
use lapin::{options::ConfirmSelectOptions, types::LongString, Connection, ConnectionProperties};
use std::{sync::Arc, time::Duration};
use tracing::{debug, error, warn};

/// Bounded retry with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        RetryPolicy {
            max_attempts: max_attempts.max(1),
            initial_delay,
            max_delay,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Bounded polling of a readiness condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessProbe {
    attempts: u32,
    interval: Duration,
}

impl Default for ReadinessProbe {
    fn default() -> Self {
        ReadinessProbe::new(1_000, Duration::from_millis(10))
    }
}

impl ReadinessProbe {
    pub fn new(attempts: u32, interval: Duration) -> Self {
        ReadinessProbe {
            attempts: attempts.max(1),
            interval,
        }
    }

    /// Upper bound of time spent in [`ReadinessProbe::wait_for`].
    pub fn budget(&self) -> Duration {
        self.interval.saturating_mul(self.attempts)
    }

    /// Polls `ready` until it holds or the attempt budget is exhausted.
    pub async fn wait_for<F>(&self, ready: F) -> bool
    where
        F: Fn() -> bool,
    {
        for attempt in 1..=self.attempts {
            if ready() {
                return true;
            }

            if attempt < self.attempts {
                tokio::time::sleep(self.interval).await;
            }
        }

        false
    }
}

/// Owner of the broker connection and its channel.
pub struct ConnectionManager {
    cfg: RabbitMQConfigs,
    retry: RetryPolicy,
    readiness: ReadinessProbe,
    connection: Option<Arc<Connection>>,
    channel: Option<Arc<LapinChannel>>,
}

impl ConnectionManager {
    pub fn new(cfg: RabbitMQConfigs) -> Self {
        ConnectionManager {
            retry: cfg.retry_policy(),
            readiness: cfg.readiness_probe(),
            cfg,
            connection: None,
            channel: None,
        }
    }

    pub fn readiness(&self) -> ReadinessProbe {
        self.readiness
    }

    /// The live channel, if one was opened.
    pub fn channel(&self) -> Option<Arc<dyn BrokerChannel>> {
        self.channel
            .clone()
            .map(|channel| channel as Arc<dyn BrokerChannel>)
    }

    /// Connects and opens the confirm-mode channel, in that order.
    pub async fn establish(&mut self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        self.connect().await?;
        self.open_channel().await
    }

    /// Opens the connection, retrying with backoff. Returns the current
    /// connection when it is already open.
    pub async fn connect(&mut self) -> Result<Arc<Connection>, AmqpError> {
        if let Some(conn) = self.connection.as_ref() {
            if conn.status().connected() {
                debug!("amqp connection already open");
                return Ok(conn.clone());
            }
        }

        let uri = self.cfg.uri();
        let max_attempts = self.retry.max_attempts();
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            debug!(
                host = self.cfg.host,
                port = self.cfg.port,
                attempt,
                "creating amqp connection..."
            );

            let options = ConnectionProperties::default()
                .with_connection_name(LongString::from(self.cfg.connection_name.clone()));

            match Connection::connect(&uri, options).await {
                Ok(conn) if conn.status().connected() => {
                    debug!("amqp connected");
                    let conn = Arc::new(conn);
                    self.connection = Some(conn.clone());
                    return Ok(conn);
                }
                Ok(_) => {
                    warn!(attempt, "amqp connection returned but is not open");
                    last_error = "connection is not open".to_owned();
                }
                Err(err) => {
                    warn!(error = err.to_string(), attempt, "failure to connect");
                    last_error = err.to_string();
                }
            }

            if attempt < max_attempts {
                tokio::time::sleep(self.retry.delay_for(attempt)).await;
            }
        }

        error!(
            error = last_error,
            attempts = max_attempts,
            "giving up connecting to rabbitmq"
        );
        Err(AmqpError::ConnectionError(last_error))
    }

    /// Opens the channel on the current connection and enables publisher
    /// confirms. Returns the current channel when it is still open.
    pub async fn open_channel(&mut self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let Some(conn) = self.connection.as_ref().filter(|c| c.status().connected()) else {
            error!("cannot open a channel without an open connection");
            return Err(AmqpError::ChannelError("connection is not open".to_owned()));
        };

        if let Some(channel) = self.channel.as_ref() {
            if channel.is_open() {
                return Ok(channel.clone());
            }
        }

        debug!("creating amqp channel...");
        let channel = conn.create_channel().await.map_err(|err| {
            error!(error = err.to_string(), "error to create the channel");
            AmqpError::ChannelError(err.to_string())
        })?;

        channel
            .confirm_select(ConfirmSelectOptions { nowait: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to enable publisher confirms");
                AmqpError::ChannelError(err.to_string())
            })?;

        let channel = Arc::new(LapinChannel::new(channel));
        debug!(id = channel.id(), "channel created");
        self.channel = Some(channel.clone());

        Ok(channel)
    }

    /// Waits, within the readiness budget, for both connection and channel to
    /// be open.
    pub async fn is_connected(&self) -> bool {
        let ready = self
            .readiness
            .wait_for(|| self.connection_open() && self.channel_open())
            .await;

        if ready {
            debug!("connection established");
        } else {
            warn!("connection was not established");
        }

        ready
    }

    /// Waits, within the readiness budget, for both channel and connection to
    /// be closed.
    pub async fn is_disconnected(&self) -> bool {
        let closed = self
            .readiness
            .wait_for(|| !self.connection_open() && !self.channel_open())
            .await;

        if closed {
            debug!("connection closed");
        }

        closed
    }

    /// Closes the channel, then the connection. Already closed resources are
    /// skipped.
    pub async fn disconnect(&mut self) -> Result<(), AmqpError> {
        let mut result = Ok(());

        match self.channel.take() {
            Some(channel) if channel.is_open() => {
                if let Err(err) = channel.close().await {
                    result = Err(err);
                }
            }
            _ => debug!("channel already closed"),
        }

        match self.connection.take() {
            Some(conn) if conn.status().connected() => {
                if let Err(err) = conn.close(200, "OK").await {
                    error!(error = err.to_string(), "error to close the connection");
                    result = result.and(Err(AmqpError::ConnectionError(err.to_string())));
                } else {
                    debug!("amqp connection closed");
                }
            }
            _ => debug!("connection already closed"),
        }

        result
    }

    fn connection_open(&self) -> bool {
        self.connection
            .as_ref()
            .is_some_and(|conn| conn.status().connected())
    }

    fn channel_open(&self) -> bool {
        self.channel
            .as_ref()
            .is_some_and(|channel| channel.is_open())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn quick_configs() -> RabbitMQConfigs {
        RabbitMQConfigs {
            host: "127.0.0.1".to_owned(),
            port: 1,
            connection_attempts: 2,
            retry_initial_delay_ms: 1,
            retry_max_delay_ms: 2,
            readiness_attempts: 5,
            readiness_interval_ms: 10,
            ..RabbitMQConfigs::default()
        }
    }

    #[test]
    fn should_back_off_exponentially_up_to_the_cap() {
        let policy = RetryPolicy::new(
            20,
            Duration::from_millis(500),
            Duration::from_secs(5),
        );

        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_secs(1));
        assert_eq!(policy.delay_for(4), Duration::from_secs(4));
        assert_eq!(policy.delay_for(5), Duration::from_secs(5));
        assert_eq!(policy.delay_for(64), Duration::from_secs(5));
    }

    #[test]
    fn should_always_try_at_least_once() {
        let policy = RetryPolicy::new(0, Duration::ZERO, Duration::ZERO);

        assert_eq!(policy.max_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn should_give_up_within_the_probe_budget() {
        let probe = ReadinessProbe::new(5, Duration::from_millis(10));
        let polls = Cell::new(0);
        let started = tokio::time::Instant::now();

        let ready = probe
            .wait_for(|| {
                polls.set(polls.get() + 1);
                false
            })
            .await;

        assert!(!ready);
        assert_eq!(polls.get(), 5);
        assert!(started.elapsed() <= probe.budget());
    }

    #[tokio::test(start_paused = true)]
    async fn should_stop_polling_once_ready() {
        let probe = ReadinessProbe::new(100, Duration::from_millis(10));
        let polls = Cell::new(0);

        let ready = probe
            .wait_for(|| {
                polls.set(polls.get() + 1);
                polls.get() == 3
            })
            .await;

        assert!(ready);
        assert_eq!(polls.get(), 3);
    }

    #[tokio::test]
    async fn should_not_report_connected_before_connecting() {
        let manager = ConnectionManager::new(quick_configs());
        let started = std::time::Instant::now();

        assert!(!manager.is_connected().await);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(manager.channel().is_none());
    }

    #[tokio::test]
    async fn should_refuse_to_open_a_channel_without_connection() {
        let mut manager = ConnectionManager::new(quick_configs());

        let result = manager.open_channel().await;

        assert!(matches!(result, Err(AmqpError::ChannelError(_))));
    }

    #[tokio::test]
    async fn should_disconnect_idempotently() {
        let mut manager = ConnectionManager::new(quick_configs());

        assert!(manager.disconnect().await.is_ok());
        assert!(manager.disconnect().await.is_ok());
        assert!(manager.is_disconnected().await);
    }

    #[tokio::test]
    async fn should_fail_after_exhausting_connection_attempts() {
        let mut manager = ConnectionManager::new(quick_configs());

        let result = manager.connect().await;

        assert!(matches!(result, Err(AmqpError::ConnectionError(_))));
        assert!(!manager.is_connected().await);
    }
}
