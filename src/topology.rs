// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! This module declares exchanges, queues and the bindings between them. All
//! declarations are idempotent on the broker side, so installing the same
//! topology twice leaves the broker in the same state.
//!
//! The main components are:
//! - `Topology` trait: builder-style interface for topology management
//! - `AmqpTopology`: implementation over a [`BrokerChannel`]
//! - `TopologySpec`: exchanges × queues layout consumed by `AmqpTopology::setup`
//!
//! Every operation first waits for the channel within the readiness budget.
//! When the channel is not open the operation is skipped and `Ok(())` is
//! returned; callers that need to tell the two apart check
//! `ConnectionManager::is_connected` themselves.

use crate::{
    channel::BrokerChannel,
    connection::ReadinessProbe,
    errors::AmqpError,
    exchange::{ExchangeDefinition, QueueNaming},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use lapin::{
    options::{ExchangeDeclareOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable, LongInt, LongString, ShortString},
};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, warn};

/// Constant for the header field used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the header field used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the header field used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the header field used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Constant for the header field used to specify maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

/// Suffix appended to queue names bound to [`QueueNaming::Suffixed`] exchanges.
pub const DEFAULT_QUEUE_SUFFIX: &str = ".compare";

/// Exchanges and queue names to cross-bind with [`AmqpTopology::setup`].
#[derive(Debug, Clone, PartialEq)]
pub struct TopologySpec {
    exchanges: Vec<ExchangeDefinition>,
    queues: Vec<String>,
    queue_suffix: String,
    with_dlq: bool,
}

impl Default for TopologySpec {
    fn default() -> Self {
        TopologySpec {
            exchanges: vec![],
            queues: vec![],
            queue_suffix: DEFAULT_QUEUE_SUFFIX.to_owned(),
            with_dlq: false,
        }
    }
}

impl TopologySpec {
    /// Creates an empty layout using the default `.compare` queue suffix.
    pub fn new() -> Self {
        TopologySpec::default()
    }

    /// Adds an exchange every queue of the layout is bound to.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    /// Adds a logical queue name.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn queue(mut self, name: &str) -> Self {
        self.queues.push(name.to_owned());
        self
    }

    /// Adds several logical queue names.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn queues<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.queues.extend(names.into_iter().map(Into::into));
        self
    }

    /// Sets the suffix used for exchanges with suffixed queue naming.
    ///
    /// # Parameters
    /// * `suffix` - Appended verbatim to the logical queue name
    ///
    /// # Returns
    /// Self for method chaining
    pub fn queue_suffix(mut self, suffix: &str) -> Self {
        self.queue_suffix = suffix.to_owned();
        self
    }

    /// Every declared queue gets a `<name>-dlq` dead letter queue.
    pub fn with_dlq(mut self) -> Self {
        self.with_dlq = true;
        self
    }

    /// Name of the queue bound to `exchange` for the logical queue `queue`.
    pub fn bound_queue_name(&self, exchange: &ExchangeDefinition, queue: &str) -> String {
        match exchange.queue_naming {
            QueueNaming::Plain => queue.to_owned(),
            QueueNaming::Suffixed => format!("{}{}", queue, self.queue_suffix),
        }
    }
}

/// Trait defining the interface for topology management.
#[async_trait]
pub trait Topology {
    /// Adds an exchange definition to the topology.
    fn exchange(self, def: ExchangeDefinition) -> Self;

    /// Adds a queue definition to the topology.
    fn queue(self, def: QueueDefinition) -> Self;

    /// Adds a queue-to-exchange binding to the topology.
    fn queue_binding(self, binding: QueueBinding) -> Self;

    /// Declares every registered exchange and queue, then every binding.
    async fn install(&self) -> Result<(), AmqpError>;
}

/// RabbitMQ implementation of the Topology trait.
pub struct AmqpTopology {
    channel: Arc<dyn BrokerChannel>,
    readiness: ReadinessProbe,
    pub(crate) queues: BTreeMap<String, QueueDefinition>,
    pub(crate) queues_binding: Vec<QueueBinding>,
    pub(crate) exchanges: Vec<ExchangeDefinition>,
}

impl AmqpTopology {
    /// Creates a new AmqpTopology instance with no registered definitions.
    ///
    /// # Parameters
    /// * `channel` - The channel declarations are made on
    /// * `readiness` - How long each operation waits for the channel
    ///
    /// # Returns
    /// A new AmqpTopology instance
    pub fn new(channel: Arc<dyn BrokerChannel>, readiness: ReadinessProbe) -> AmqpTopology {
        AmqpTopology {
            channel,
            readiness,
            queues: BTreeMap::default(),
            queues_binding: vec![],
            exchanges: vec![],
        }
    }

    /// Declares a single exchange.
    ///
    /// # Returns
    /// Ok(()) when declared or skipped because the channel is not open,
    /// `AmqpError::DeclareExchangeError` otherwise
    pub async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        if !self.ready("declare exchange").await {
            return Ok(());
        }
        self.install_exchange(def).await
    }

    /// Declares a single queue, and its DLQ first when one is configured.
    ///
    /// # Returns
    /// Ok(()) when declared or skipped because the channel is not open,
    /// `AmqpError::DeclareQueueError` otherwise
    pub async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        if !self.ready("declare queue").await {
            return Ok(());
        }
        self.install_queue(def).await
    }

    /// Binds a queue to an exchange.
    ///
    /// # Returns
    /// Ok(()) when bound or skipped because the channel is not open,
    /// `AmqpError::BindingExchangeToQueueError` otherwise
    pub async fn bind(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        if !self.ready("bind queue").await {
            return Ok(());
        }
        self.install_binding(binding).await
    }

    /// Declares every exchange of `spec` and, for each of them, every queue
    /// bound under its derived name with the queue name as routing key.
    ///
    /// Exchanges with [`QueueNaming::Plain`] bind `queue`; exchanges with
    /// [`QueueNaming::Suffixed`] bind `queue` + the layout's suffix. Running
    /// the same setup again issues the same declarations.
    ///
    /// # Parameters
    /// * `spec` - The exchanges and logical queues to cross-bind
    ///
    /// # Returns
    /// Ok(()) when installed or skipped because the channel is not open, or
    /// the first declaration or binding error
    pub async fn setup(&self, spec: &TopologySpec) -> Result<(), AmqpError> {
        if !self.ready("setup topology").await {
            return Ok(());
        }

        for exch in &spec.exchanges {
            self.install_exchange(exch).await?;

            for queue in &spec.queues {
                let name = spec.bound_queue_name(exch, queue);

                let mut def = QueueDefinition::new(&name);
                if spec.with_dlq {
                    def = def.with_dlq();
                }
                self.install_queue(&def).await?;

                let binding = QueueBinding::new(&name)
                    .exchange(&exch.name)
                    .routing_key(&name);
                self.install_binding(&binding).await?;
            }
        }

        debug!(
            exchanges = spec.exchanges.len(),
            queues = spec.queues.len(),
            "topology installed"
        );

        Ok(())
    }
}

#[async_trait]
impl Topology for AmqpTopology {
    fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.insert(def.name.clone(), def);
        self
    }

    fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.queues_binding.push(binding);
        self
    }

    async fn install(&self) -> Result<(), AmqpError> {
        if !self.ready("install topology").await {
            return Ok(());
        }

        for exch in &self.exchanges {
            self.install_exchange(exch).await?;
        }

        for def in self.queues.values() {
            self.install_queue(def).await?;
        }

        for binding in &self.queues_binding {
            self.install_binding(binding).await?;
        }

        Ok(())
    }
}

impl AmqpTopology {
    async fn ready(&self, operation: &str) -> bool {
        let channel = self.channel.clone();
        let ready = self.readiness.wait_for(|| channel.is_open()).await;

        if !ready {
            warn!(operation, "channel is not open, skipping");
        }

        ready
    }

    async fn install_exchange(&self, exch: &ExchangeDefinition) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", exch.name);

        self.channel
            .exchange_declare(
                &exch.name,
                exch.kind.into(),
                ExchangeDeclareOptions {
                    passive: exch.passive,
                    durable: exch.durable,
                    auto_delete: exch.delete,
                    internal: exch.internal,
                    nowait: exch.no_wait,
                },
                FieldTable::from(exch.params.clone()),
            )
            .await?;

        debug!("exchange: {} was created", exch.name);
        Ok(())
    }

    /// Declares the queue, preceded by its DLQ when one is configured.
    async fn install_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        debug!("creating queue: {}", def.name);

        let mut queue_args = BTreeMap::new();

        if let Some(dlq_name) = &def.dlq_name {
            self.declare_dlq(def, dlq_name).await?;

            queue_args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
                AMQPValue::LongString(LongString::from("")),
            );
            queue_args.insert(
                ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
                AMQPValue::LongString(LongString::from(dlq_name.as_str())),
            );
        }

        if let Some(ttl) = def.ttl {
            queue_args.insert(
                ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
                AMQPValue::LongInt(LongInt::from(ttl)),
            );
        }

        if let Some(max) = def.max_length {
            queue_args.insert(
                ShortString::from(AMQP_HEADERS_MAX_LENGTH),
                AMQPValue::LongInt(LongInt::from(max)),
            );
        }

        if let Some(max_bytes) = def.max_length_bytes {
            queue_args.insert(
                ShortString::from(AMQP_HEADERS_MAX_LENGTH_BYTES),
                AMQPValue::LongInt(LongInt::from(max_bytes)),
            );
        }

        self.channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: def.no_wait,
                },
                FieldTable::from(queue_args),
            )
            .await?;

        debug!("queue: {} was created", def.name);
        Ok(())
    }

    async fn declare_dlq(&self, def: &QueueDefinition, dlq_name: &str) -> Result<(), AmqpError> {
        self.channel
            .queue_declare(
                dlq_name,
                QueueDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: def.no_wait,
                },
                FieldTable::default(),
            )
            .await
    }

    async fn install_binding(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );

        self.channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
            )
            .await
    }
}
