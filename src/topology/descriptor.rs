//! Topology descriptor types.
//!
//! A `TopologyDescriptor` is plain data: every broker-side object (exchange,
//! queue, binding) and every policy (connection, publish, consume) a facade
//! needs. It is rebuilt wholesale on each configuration load and compared by
//! value, so nothing in here holds closures or live handles.

use std::collections::BTreeMap;
use std::time::Duration;

use lapin::uri::AMQPUri;

use crate::utils::{BrokerError, Result};

pub const MESSAGE_TTL_ARG: &str = "x-message-ttl";
pub const QUEUE_TYPE_ARG: &str = "x-queue-type";

/// Resolves a broker object name from a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameGenerator {
    /// Ignores the topic and always yields the same name.
    Static(String),
    /// Uses the topic verbatim.
    Topic,
    /// Looks the topic up, falling back to one name for unknown topics.
    PerTopic {
        routes: BTreeMap<String, String>,
        fallback: String,
    },
}

impl NameGenerator {
    pub fn generate(&self, topic: &str) -> String {
        match self {
            Self::Static(name) => name.clone(),
            Self::Topic => topic.to_string(),
            Self::PerTopic { routes, fallback } => {
                routes.get(topic).unwrap_or(fallback).clone()
            }
        }
    }
}

/// Exponential backoff used when an established connection drops.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub initial_interval: Duration,
    pub multiplier: f64,
    pub max_interval: Duration,
    /// `None` retries forever.
    pub max_elapsed: Option<Duration>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            multiplier: 1.5,
            max_interval: Duration::from_secs(60),
            max_elapsed: None,
        }
    }
}

impl ReconnectPolicy {
    /// Successive waits between reconnect attempts.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + Send + 'static {
        let multiplier = self.multiplier.max(1.0);
        let max_interval = self.max_interval;
        let max_elapsed = self.max_elapsed;
        let mut next = self.initial_interval.min(max_interval);
        let mut elapsed = Duration::ZERO;

        std::iter::from_fn(move || {
            if let Some(limit) = max_elapsed {
                if elapsed + next > limit {
                    return None;
                }
            }
            let current = next;
            elapsed += current;
            next = current.mul_f64(multiplier).min(max_interval);
            Some(current)
        })
    }
}

/// TLS settings of the broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TlsPolicy {
    /// Accept any server certificate. Off unless explicitly configured.
    pub insecure_skip_verify: bool,
}

/// Where and how to dial the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionPolicy {
    pub uri: String,
    pub vhost: String,
    pub tls: TlsPolicy,
    pub reconnect: ReconnectPolicy,
}

impl ConnectionPolicy {
    /// Parse the configured URI and apply the virtual host.
    pub fn amqp_uri(&self) -> Result<AMQPUri> {
        let mut uri: AMQPUri = self
            .uri
            .parse()
            .map_err(|e: String| BrokerError::Connection(format!("invalid broker uri: {e}")))?;
        if !self.vhost.is_empty() {
            uri.vhost = self.vhost.clone();
        }
        Ok(uri)
    }
}

/// Routing behaviour of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Topic,
    Direct,
    Fanout,
}

/// Exchange messages are published to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeDescriptor {
    pub name: NameGenerator,
    pub kind: ExchangeKind,
    pub durable: bool,
}

/// Scalar value of a queue argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgValue {
    Int(i64),
    Str(String),
    Bool(bool),
}

/// Queue a subscriber consumes from, with its declaration arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDescriptor {
    pub name: NameGenerator,
    pub durable: bool,
    pub auto_delete: bool,
    pub arguments: BTreeMap<String, ArgValue>,
}

impl QueueDescriptor {
    /// Per-message expiry from the `x-message-ttl` argument.
    pub fn message_ttl(&self) -> Option<Duration> {
        match self.arguments.get(MESSAGE_TTL_ARG) {
            Some(ArgValue::Int(ms)) if *ms >= 0 => Some(Duration::from_millis(*ms as u64)),
            _ => None,
        }
    }
}

/// Pattern binding the queue to the exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingDescriptor {
    pub routing_key: NameGenerator,
}

/// Routing key attached to published messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishPolicy {
    pub routing_key: NameGenerator,
}

/// Consumer settings; `prefetch_count` caps unacknowledged deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumePolicy {
    pub prefetch_count: u16,
}

/// Wire encoding of messages.
///
/// `Default` sends the payload as the message body, carries the id in the
/// `message_id` property and marks messages persistent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Marshaler {
    #[default]
    Default,
}

/// Whether exchange, queue and binding are declared on first use or must
/// already exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TopologyCreation {
    #[default]
    AutoCreate,
    Existing,
}

/// Everything a facade declares on the broker and how it publishes and
/// consumes. Built by `topology::build`.
#[derive(Debug, Clone, PartialEq)]
pub struct TopologyDescriptor {
    pub connection: ConnectionPolicy,
    pub exchange: ExchangeDescriptor,
    pub queue: QueueDescriptor,
    pub binding: BindingDescriptor,
    pub publish: PublishPolicy,
    pub consume: ConsumePolicy,
    pub marshaler: Marshaler,
    pub creation: TopologyCreation,
}

/// Broker object names resolved for one topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTopology {
    pub exchange: String,
    pub queue: String,
    pub binding_key: String,
    pub publish_key: String,
}

impl TopologyDescriptor {
    /// Names of the broker objects used for `topic`.
    pub fn resolve(&self, topic: &str) -> ResolvedTopology {
        ResolvedTopology {
            exchange: self.exchange.name.generate(topic),
            queue: self.queue.name.generate(topic),
            binding_key: self.binding.routing_key.generate(topic),
            publish_key: self.publish.routing_key.generate(topic),
        }
    }
}
