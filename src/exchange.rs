// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! Exchanges are declared durable and never auto-deleted unless the
//! definition says otherwise. Each definition also carries the naming rule
//! applied to the queues bound to it by
//! [`AmqpTopology::setup`](crate::topology::AmqpTopology::setup).

use crate::errors::AmqpError;
use lapin::types::{AMQPValue, ShortString};
use std::{collections::BTreeMap, fmt, str::FromStr};

/// Routing behaviour of an exchange.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Routes to queues whose binding key equals the routing key
    #[default]
    Direct,
    /// Routes to every bound queue, ignoring the routing key
    Fanout,
    /// Routes by wildcard match of the routing key against binding patterns
    Topic,
    /// Routes by matching message headers instead of the routing key
    Headers,
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
        }
    }
}

impl FromStr for ExchangeKind {
    type Err = AmqpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "direct" => Ok(ExchangeKind::Direct),
            "fanout" => Ok(ExchangeKind::Fanout),
            "topic" => Ok(ExchangeKind::Topic),
            "headers" => Ok(ExchangeKind::Headers),
            other => Err(AmqpError::DeclareExchangeError(format!(
                "unknown exchange kind `{other}`"
            ))),
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
        };
        f.write_str(kind)
    }
}

/// How queue names are derived when queues are bound to an exchange.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum QueueNaming {
    /// Bind the queue under its own name.
    #[default]
    Plain,
    /// Bind `<queue><suffix>`, using the topology's queue suffix.
    Suffixed,
}

/// Definition of a RabbitMQ exchange.
///
/// Built with chained calls starting from [`ExchangeDefinition::new`] and
/// declared by [`AmqpTopology`](crate::topology::AmqpTopology).
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) delete: bool,
    pub(crate) durable: bool,
    pub(crate) passive: bool,
    pub(crate) internal: bool,
    pub(crate) no_wait: bool,
    pub(crate) params: BTreeMap<ShortString, AMQPValue>,
    pub(crate) queue_naming: QueueNaming,
}

impl ExchangeDefinition {
    /// Creates a new exchange definition with the given name.
    ///
    /// The exchange is a durable Direct exchange whose bound queues keep
    /// their own names.
    ///
    /// # Parameters
    /// * `name` - The name of the exchange
    ///
    /// # Returns
    /// A new exchange definition with default settings
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            kind: ExchangeKind::Direct,
            delete: false,
            durable: true,
            passive: false,
            internal: false,
            no_wait: false,
            params: BTreeMap::default(),
            queue_naming: QueueNaming::Plain,
        }
    }

    /// Name of the exchange.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sets the exchange type.
    ///
    /// # Parameters
    /// * `kind` - The exchange type
    ///
    /// # Returns
    /// Self for method chaining
    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    /// Sets the exchange type to Direct.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn direct(self) -> Self {
        self.kind(ExchangeKind::Direct)
    }

    /// Sets the exchange type to Fanout.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn fanout(self) -> Self {
        self.kind(ExchangeKind::Fanout)
    }

    /// Sets the exchange type to Topic.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn topic(self) -> Self {
        self.kind(ExchangeKind::Topic)
    }

    /// Sets the exchange type to Headers.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn headers(self) -> Self {
        self.kind(ExchangeKind::Headers)
    }

    /// Queues bound to this exchange get the topology's suffix appended to
    /// their name, so the same logical queue can be bound to several
    /// exchanges under distinct names.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn suffixed_queues(mut self) -> Self {
        self.queue_naming = QueueNaming::Suffixed;
        self
    }

    /// Sets how bound queue names are derived.
    ///
    /// # Parameters
    /// * `naming` - The naming rule
    ///
    /// # Returns
    /// Self for method chaining
    pub fn queue_naming(mut self, naming: QueueNaming) -> Self {
        self.queue_naming = naming;
        self
    }

    /// Adds a single argument to the exchange declaration.
    ///
    /// # Parameters
    /// * `key` - The argument name
    /// * `value` - The argument value
    ///
    /// # Returns
    /// Self for method chaining
    pub fn param(mut self, key: ShortString, value: AMQPValue) -> Self {
        self.params.insert(key, value);
        self
    }

    /// Sets the exchange to auto-delete when no longer used.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the exchange transient; it does not survive a broker restart.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn transient(mut self) -> Self {
        self.durable = false;
        self
    }

    /// Makes the exchange passive, checking for existence without creating it.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Makes the exchange internal; clients cannot publish to it directly.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    /// Declares without waiting for the broker's answer.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }
}
