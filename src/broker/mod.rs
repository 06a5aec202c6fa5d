//! The `broker` module is what applications talk to.
//!
//! [`MessageBroker`] is the capability every backend shares: load its
//! configuration, run a subscribe loop, publish one message. [`Backend`] is
//! the closed set of backends an application can pick from configuration:
//! - [`RabbitMq`]: the working AMQP facade
//! - [`KafkaMq`]: a placeholder whose every operation fails promptly with
//!   `Unimplemented`
//!
//! New backends are added as a variant here; call sites keep using
//! `MessageBroker`.

pub mod kafka;
pub mod rabbitmq;

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{BackendKind, BrokerSettings, ParameterProvider};
use crate::message::InboundMessage;
use crate::transport::Transport;
use crate::utils::Result;

pub use kafka::KafkaMq;
pub use rabbitmq::{FacadeState, RabbitMq};

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Rebuild the topology from the configuration provider.
    fn load_configuration(&self) -> Result<()>;

    /// Consume the configured topic until `cancel` fires or the broker ends
    /// the stream, logging and acknowledging every message.
    async fn subscribe(&self, cancel: CancellationToken) -> Result<()>;

    /// Publish `data` once to the configured topic; returns the message id.
    async fn publish(&self, data: &[u8]) -> Result<String>;
}

/// Processing stage of a subscribe loop.
///
/// `Ok` acknowledges the message. `Err` rejects it with requeue, so the
/// broker redelivers it.
#[async_trait]
pub trait MessageHandler: Send {
    async fn handle(&mut self, message: &InboundMessage) -> std::result::Result<(), HandlerError>;
}

/// Logs each payload and accepts it.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingHandler;

#[async_trait]
impl MessageHandler for LoggingHandler {
    async fn handle(&mut self, message: &InboundMessage) -> std::result::Result<(), HandlerError> {
        info!(
            payload = %String::from_utf8_lossy(message.payload()),
            message_id = message.id(),
            "Received message from RabbitMq"
        );
        Ok(())
    }
}

pub enum Backend {
    RabbitMq(RabbitMq),
    Kafka(KafkaMq),
}

impl Backend {
    /// Pick the backend named in `settings`.
    pub fn from_settings(
        settings: &BrokerSettings,
        provider: Arc<dyn ParameterProvider>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        match settings.backend {
            BackendKind::RabbitMq => {
                Backend::RabbitMq(RabbitMq::new(provider, transport).with_topic(&settings.topic))
            }
            BackendKind::Kafka => Backend::Kafka(KafkaMq::new()),
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::RabbitMq(_) => BackendKind::RabbitMq,
            Backend::Kafka(_) => BackendKind::Kafka,
        }
    }
}

#[async_trait]
impl MessageBroker for Backend {
    fn load_configuration(&self) -> Result<()> {
        match self {
            Backend::RabbitMq(broker) => MessageBroker::load_configuration(broker),
            Backend::Kafka(broker) => broker.load_configuration(),
        }
    }

    async fn subscribe(&self, cancel: CancellationToken) -> Result<()> {
        match self {
            Backend::RabbitMq(broker) => MessageBroker::subscribe(broker, cancel).await,
            Backend::Kafka(broker) => broker.subscribe(cancel).await,
        }
    }

    async fn publish(&self, data: &[u8]) -> Result<String> {
        match self {
            Backend::RabbitMq(broker) => MessageBroker::publish(broker, data).await,
            Backend::Kafka(broker) => broker.publish(data).await,
        }
    }
}
