//! AMQP 0-9-1 transport
//!
//! Framing, heartbeats and TLS are delegated to `lapin`. This module only
//! maps a `TopologyDescriptor` onto channel operations:
//! - publishers keep one connection and one confirm-mode channel. A dropped
//!   connection gets `PUBLISH_REDIAL_ATTEMPTS` re-dials, then the publish
//!   fails with `Connection` instead of waiting for the broker
//! - subscribers declare queue, exchange and binding, apply `basic_qos` and
//!   consume with manual acknowledgement; a consumer that ends without being
//!   cancelled is restarted on a fresh connection
//!
//! Security note: `lapin` only offers verified TLS. A topology asking for
//! `insecure_skip_verify` on an `amqps` URI is refused instead of silently
//! connecting with verification on.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::uri::AMQPScheme;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::message::{Acknowledger, InboundMessage, OutboundMessage, new_message_id};
use crate::topology::{
    ArgValue, ConnectionPolicy, ExchangeKind, Marshaler, ResolvedTopology, TopologyCreation,
    TopologyDescriptor,
};
use crate::transport::{MessageStream, Publisher, Subscriber, Transport, until_cancelled};
use crate::utils::{BrokerError, Result};

const PERSISTENT: u8 = 2;

/// Re-dial attempts a publisher makes before failing the publish call.
pub(crate) const PUBLISH_REDIAL_ATTEMPTS: usize = 2;

/// `Transport` that dials a real broker.
#[derive(Debug, Clone, Default)]
pub struct AmqpTransport;

impl AmqpTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn open_subscriber(
        &self,
        topology: Arc<TopologyDescriptor>,
    ) -> Result<Box<dyn Subscriber>> {
        let connection = connect(&topology.connection).await?;
        Ok(Box::new(AmqpSubscriber {
            topology,
            connection: Some(connection),
        }))
    }

    async fn open_publisher(
        &self,
        topology: Arc<TopologyDescriptor>,
    ) -> Result<Box<dyn Publisher>> {
        let connection = connect(&topology.connection).await?;
        let channel = confirm_channel(&connection).await?;
        Ok(Box::new(AmqpPublisher {
            topology,
            connection,
            channel,
            declared: HashSet::new(),
        }))
    }
}

pub(crate) fn check_tls(policy: &ConnectionPolicy) -> Result<lapin::uri::AMQPUri> {
    let uri = policy.amqp_uri()?;
    if policy.tls.insecure_skip_verify {
        if uri.scheme == AMQPScheme::AMQPS {
            error!("TLS certificate verification cannot be disabled for AMQP connections");
            return Err(BrokerError::Connection(
                "insecure_skip_verify is not supported by the AMQP transport".to_string(),
            ));
        }
        warn!("insecure_skip_verify has no effect on a plain amqp:// connection");
    }
    Ok(uri)
}

async fn connect(policy: &ConnectionPolicy) -> Result<Connection> {
    let uri = check_tls(policy)?;
    Connection::connect_uri(uri, ConnectionProperties::default())
        .await
        .map_err(|e| BrokerError::Connection(e.to_string()))
}

/// Dial again, waiting out the reconnect policy between at most `attempts`
/// attempts.
pub(crate) async fn reconnect(
    policy: &ConnectionPolicy,
    cancel: Option<&CancellationToken>,
    attempts: usize,
) -> Result<Connection> {
    let mut last = BrokerError::Connection("reconnect policy allows no attempts".to_string());
    for delay in policy.reconnect.delays().take(attempts) {
        match cancel {
            Some(token) => {
                tokio::select! {
                    _ = token.cancelled() => return Err(BrokerError::Connection("cancelled".to_string())),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            None => tokio::time::sleep(delay).await,
        }
        match connect(policy).await {
            Ok(connection) => {
                info!("Reconnected to broker");
                return Ok(connection);
            }
            Err(err) => {
                warn!(error = %err, ?delay, "Reconnect attempt failed");
                last = err;
            }
        }
    }
    Err(last)
}

async fn confirm_channel(connection: &Connection) -> Result<Channel> {
    let channel = connection
        .create_channel()
        .await
        .map_err(|e| BrokerError::Connection(e.to_string()))?;
    channel
        .confirm_select(ConfirmSelectOptions::default())
        .await
        .map_err(|e| BrokerError::Connection(e.to_string()))?;
    Ok(channel)
}

pub(crate) fn exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
    }
}

pub(crate) fn field_table(arguments: &BTreeMap<String, ArgValue>) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in arguments {
        let value = match value {
            ArgValue::Int(v) => AMQPValue::LongLongInt(*v),
            ArgValue::Str(v) => AMQPValue::LongString(v.clone().into()),
            ArgValue::Bool(v) => AMQPValue::Boolean(*v),
        };
        table.insert(ShortString::from(key.clone()), value);
    }
    table
}

pub(crate) fn marshal(marshaler: Marshaler, message: &OutboundMessage) -> BasicProperties {
    match marshaler {
        Marshaler::Default => BasicProperties::default()
            .with_message_id(ShortString::from(message.id.clone()))
            .with_delivery_mode(PERSISTENT),
    }
}

/// Message id carried by `properties`, or a fresh one when the sender set none.
pub(crate) fn unmarshal_id(marshaler: Marshaler, properties: &BasicProperties) -> String {
    match marshaler {
        Marshaler::Default => properties
            .message_id()
            .as_ref()
            .map(|id| id.as_str().to_string())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(new_message_id),
    }
}

async fn declare_exchange(
    channel: &Channel,
    topology: &TopologyDescriptor,
    name: &str,
) -> lapin::Result<()> {
    channel
        .exchange_declare(
            name,
            exchange_kind(topology.exchange.kind),
            ExchangeDeclareOptions {
                passive: topology.creation == TopologyCreation::Existing,
                durable: topology.exchange.durable,
                ..ExchangeDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
}

async fn declare_for_consume(
    channel: &Channel,
    topology: &TopologyDescriptor,
    resolved: &ResolvedTopology,
) -> lapin::Result<()> {
    channel
        .queue_declare(
            &resolved.queue,
            QueueDeclareOptions {
                passive: topology.creation == TopologyCreation::Existing,
                durable: topology.queue.durable,
                auto_delete: topology.queue.auto_delete,
                ..QueueDeclareOptions::default()
            },
            field_table(&topology.queue.arguments),
        )
        .await?;

    if !resolved.exchange.is_empty() {
        declare_exchange(channel, topology, &resolved.exchange).await?;
        channel
            .queue_bind(
                &resolved.queue,
                &resolved.exchange,
                &resolved.binding_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
    }
    Ok(())
}

/// Open a channel on `connection` and start consuming `resolved.queue`.
async fn start_consumer(
    connection: &Connection,
    topology: &TopologyDescriptor,
    resolved: &ResolvedTopology,
) -> lapin::Result<(Channel, lapin::Consumer)> {
    let channel = connection.create_channel().await?;
    declare_for_consume(&channel, topology, resolved).await?;
    channel
        .basic_qos(topology.consume.prefetch_count, BasicQosOptions::default())
        .await?;
    let consumer = channel
        .basic_consume(
            &resolved.queue,
            &format!("amqp-bridge-{}", new_message_id()),
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await?;
    Ok((channel, consumer))
}

struct AmqpAcker {
    acker: Acker,
}

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(self: Box<Self>) -> Result<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| BrokerError::Acknowledge(e.to_string()))
    }

    async fn nack(self: Box<Self>, requeue: bool) -> Result<()> {
        self.acker
            .nack(BasicNackOptions {
                requeue,
                ..BasicNackOptions::default()
            })
            .await
            .map(|_| ())
            .map_err(|e| BrokerError::Acknowledge(e.to_string()))
    }
}

fn inbound(marshaler: Marshaler, delivery: Delivery) -> InboundMessage {
    let id = unmarshal_id(marshaler, &delivery.properties);
    InboundMessage::new(
        id,
        delivery.data,
        Box::new(AmqpAcker {
            acker: delivery.acker,
        }),
    )
}

struct AmqpSubscriber {
    topology: Arc<TopologyDescriptor>,
    connection: Option<Connection>,
}

struct ConsumeLoop {
    topology: Arc<TopologyDescriptor>,
    resolved: ResolvedTopology,
    cancel: CancellationToken,
    _connection: Connection,
    _channel: Channel,
    consumer: lapin::Consumer,
}

impl ConsumeLoop {
    async fn next(&mut self) -> Option<InboundMessage> {
        loop {
            match self.consumer.next().await {
                Some(Ok(delivery)) => return Some(inbound(self.topology.marshaler, delivery)),
                Some(Err(err)) => warn!(error = %err, "Consumer failed"),
                None => {}
            }
            if self.cancel.is_cancelled() {
                return None;
            }
            if let Err(err) = self.restart().await {
                error!(error = %err, queue = %self.resolved.queue, "Giving up on consumer");
                return None;
            }
        }
    }

    async fn restart(&mut self) -> Result<()> {
        loop {
            let connection =
                reconnect(&self.topology.connection, Some(&self.cancel), usize::MAX).await?;
            match start_consumer(&connection, &self.topology, &self.resolved).await {
                Ok((channel, consumer)) => {
                    self._connection = connection;
                    self._channel = channel;
                    self.consumer = consumer;
                    return Ok(());
                }
                Err(err) => warn!(error = %err, "Re-declaring consumer failed"),
            }
        }
    }
}

#[async_trait]
impl Subscriber for AmqpSubscriber {
    async fn subscribe(&mut self, cancel: CancellationToken, topic: &str) -> Result<MessageStream> {
        let resolved = self.topology.resolve(topic);
        let connection = match self.connection.take() {
            Some(connection) if connection.status().connected() => connection,
            _ => connect(&self.topology.connection).await?,
        };
        let (channel, consumer) = start_consumer(&connection, &self.topology, &resolved)
            .await
            .map_err(|e| BrokerError::subscription(topic, e))?;

        let state = ConsumeLoop {
            topology: self.topology.clone(),
            resolved,
            cancel: cancel.clone(),
            _connection: connection,
            _channel: channel,
            consumer,
        };
        let stream = futures::stream::unfold(state, |mut state| async move {
            let message = state.next().await?;
            Some((message, state))
        });
        Ok(until_cancelled(stream, cancel))
    }
}

struct AmqpPublisher {
    topology: Arc<TopologyDescriptor>,
    connection: Connection,
    channel: Channel,
    declared: HashSet<String>,
}

impl AmqpPublisher {
    async fn ensure_channel(&mut self) -> Result<()> {
        if self.connection.status().connected() && self.channel.status().connected() {
            return Ok(());
        }
        warn!("Publisher channel lost, reopening");
        if !self.connection.status().connected() {
            self.connection =
                reconnect(&self.topology.connection, None, PUBLISH_REDIAL_ATTEMPTS).await?;
        }
        self.channel = confirm_channel(&self.connection).await?;
        self.declared.clear();
        Ok(())
    }
}

#[async_trait]
impl Publisher for AmqpPublisher {
    async fn publish(&mut self, topic: &str, message: OutboundMessage) -> Result<()> {
        self.ensure_channel().await?;
        let resolved = self.topology.resolve(topic);

        if !resolved.exchange.is_empty() && !self.declared.contains(&resolved.exchange) {
            declare_exchange(&self.channel, &self.topology, &resolved.exchange)
                .await
                .map_err(|e| BrokerError::publish(topic, e))?;
            self.declared.insert(resolved.exchange.clone());
        }

        let properties = marshal(self.topology.marshaler, &message);
        let confirmation = self
            .channel
            .basic_publish(
                &resolved.exchange,
                &resolved.publish_key,
                BasicPublishOptions::default(),
                &message.payload,
                properties,
            )
            .await
            .map_err(|e| BrokerError::publish(topic, e))?
            .await
            .map_err(|e| BrokerError::publish(topic, e))?;

        if confirmation.is_nack() {
            return Err(BrokerError::publish(topic, "broker did not confirm the message"));
        }
        Ok(())
    }
}
