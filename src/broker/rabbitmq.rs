//! RabbitMq facade
//!
//! Owns one topology descriptor and composes a `Transport` into two
//! operations:
//! - `subscribe`: reload configuration, open a subscriber on a topic, then
//!   relay every message to a handler and settle it
//! - `publish`: reload configuration, then publish exactly once
//!
//! Both run on the facade's own topic unless called through `subscribe_to`
//! or `publish_to`, which take the topic per call.
//!
//! The facade moves through three states: `Unconfigured` until the first
//! successful configuration load, `Configured` afterwards and `Active` while a
//! subscribe or publish call runs. Reloading swaps in a freshly built
//! descriptor; a running subscribe loop keeps the descriptor it opened with.
//!
//! Concurrency notes:
//! - the subscribe loop has two stages joined by a relay channel of capacity
//!   one. A spawned task drains the transport stream, the calling task
//!   handles and acknowledges. A slow handler stalls the drain task, which
//!   stops pulling from the transport, so deliveries back up at the broker
//!   (bounded by the prefetch count) and never inside the facade.
//! - publishes are serialized on one cached publisher handle, which is
//!   reopened whenever the reloaded topology differs from the one it was
//!   opened with or after a failed publish.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, info_span, warn};

use crate::broker::{LoggingHandler, MessageBroker, MessageHandler};
use crate::config::{DEFAULT_TOPIC, ParameterProvider};
use crate::message::{InboundMessage, OutboundMessage};
use crate::topology::{self, TopologyDescriptor};
use crate::transport::{MessageStream, Publisher, Transport};
use crate::utils::{BrokerError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FacadeState {
    Unconfigured,
    Configured,
    Active,
}

struct CachedPublisher {
    topology: Arc<TopologyDescriptor>,
    handle: Box<dyn Publisher>,
}

pub struct RabbitMq {
    provider: Arc<dyn ParameterProvider>,
    transport: Arc<dyn Transport>,
    topic: String,
    span: Span,
    topology: RwLock<Option<Arc<TopologyDescriptor>>>,
    publisher: Mutex<Option<CachedPublisher>>,
    active: AtomicUsize,
}

/// Counts a running operation for `FacadeState::Active`.
struct ActiveGuard<'a>(&'a AtomicUsize);

impl<'a> ActiveGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl RabbitMq {
    pub fn new(provider: Arc<dyn ParameterProvider>, transport: Arc<dyn Transport>) -> Self {
        Self {
            provider,
            transport,
            topic: DEFAULT_TOPIC.to_string(),
            span: info_span!("broker", backend = "rabbitmq"),
            topology: RwLock::new(None),
            publisher: Mutex::new(None),
            active: AtomicUsize::new(0),
        }
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    /// Span every log event of this facade is recorded in.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn state(&self) -> FacadeState {
        if self.active.load(Ordering::SeqCst) > 0 {
            return FacadeState::Active;
        }
        match self.topology.read() {
            Ok(topology) if topology.is_some() => FacadeState::Configured,
            _ => FacadeState::Unconfigured,
        }
    }

    /// The descriptor built by the last successful configuration load.
    pub fn topology(&self) -> Option<Arc<TopologyDescriptor>> {
        self.topology.read().ok().and_then(|t| t.clone())
    }

    /// Rebuild the topology descriptor from the provider and replace the
    /// current one. On failure the previous descriptor stays in place.
    pub fn load_configuration(&self) -> Result<Arc<TopologyDescriptor>> {
        self.configure(&self.topic, "load_configuration")
    }

    fn configure(&self, topic: &str, operation: &str) -> Result<Arc<TopologyDescriptor>> {
        let _enter = self.span.enter();
        info!(topic, operation, "Loading configuration for RabbitMq...");

        let topology = self
            .provider
            .parameters()
            .and_then(|params| topology::build(&params))
            .inspect_err(|err| {
                error!(topic, operation, error = %err, "Error loading configuration")
            })?;
        if topology.connection.tls.insecure_skip_verify {
            warn!("TLS certificate verification is disabled by configuration");
        }

        let topology = Arc::new(topology);
        let mut current = self
            .topology
            .write()
            .map_err(|_| BrokerError::Config("topology lock poisoned".to_string()))?;
        *current = Some(topology.clone());

        info!("Configuration loaded");
        Ok(topology)
    }

    /// Subscribe, logging and acknowledging every message.
    pub async fn subscribe(&self, cancel: CancellationToken) -> Result<()> {
        self.subscribe_with(cancel, LoggingHandler).await
    }

    /// Subscribe to the facade's topic and run every message through
    /// `handler` before settling it.
    pub async fn subscribe_with<H>(&self, cancel: CancellationToken, handler: H) -> Result<()>
    where
        H: MessageHandler,
    {
        self.subscribe_to(cancel, &self.topic, handler).await
    }

    /// Subscribe to `topic` and run every message through `handler` before
    /// settling it.
    ///
    /// Returns once the transport stream ends: after `cancel` fires or when
    /// the transport gives up. Opening the subscriber is not retried.
    pub async fn subscribe_to<H>(
        &self,
        cancel: CancellationToken,
        topic: &str,
        handler: H,
    ) -> Result<()>
    where
        H: MessageHandler,
    {
        self.run_subscribe(cancel, topic, handler)
            .instrument(self.span.clone())
            .await
    }

    async fn run_subscribe<H>(
        &self,
        cancel: CancellationToken,
        topic: &str,
        handler: H,
    ) -> Result<()>
    where
        H: MessageHandler,
    {
        let topology = self.configure(topic, "subscribe")?;
        let _active = ActiveGuard::enter(&self.active);

        info!(topic, "Subscribing RabbitMq to topic...");
        let mut subscriber = self
            .transport
            .open_subscriber(topology)
            .await
            .inspect_err(|err| error!(topic, error = %err, "Error creating subscriber"))?;
        let stream = subscriber
            .subscribe(cancel, topic)
            .await
            .inspect_err(|err| error!(topic, error = %err, "Error subscribing to RabbitMq"))?;
        info!(topic, "RabbitMq subscribed");

        relay(stream, topic, handler).await;

        info!(topic, "RabbitMq subscription ended");
        Ok(())
    }

    /// Publish `data` once to the facade's topic and return its message id.
    pub async fn publish(&self, data: &[u8]) -> Result<String> {
        self.publish_to(&self.topic, data).await
    }

    /// Publish `data` once to `topic` and return its message id.
    pub async fn publish_to(&self, topic: &str, data: &[u8]) -> Result<String> {
        self.run_publish(topic, data)
            .instrument(self.span.clone())
            .await
    }

    async fn run_publish(&self, topic: &str, data: &[u8]) -> Result<String> {
        let topology = self.configure(topic, "publish")?;
        let _active = ActiveGuard::enter(&self.active);

        info!(topic, "Publishing RabbitMq to topic...");
        let mut cached = self.publisher.lock().await;
        let current = match cached.take() {
            Some(existing) if *existing.topology == *topology => existing,
            _ => CachedPublisher {
                handle: self
                    .transport
                    .open_publisher(topology.clone())
                    .await
                    .inspect_err(|err| error!(topic, error = %err, "Error creating publisher"))?,
                topology,
            },
        };
        let current = cached.insert(current);

        let message = OutboundMessage::new(data);
        let id = message.id.clone();
        match current.handle.publish(topic, message).await {
            Ok(()) => {
                info!(topic, message_id = %id, "RabbitMq published message");
                Ok(id)
            }
            Err(err) => {
                error!(topic, error = %err, "Error publishing message in RabbitMq");
                *cached = None;
                Err(err)
            }
        }
    }
}

/// Drain `stream` through a one-slot channel into the handler, then settle
/// each message on the handler's verdict.
async fn relay<H>(mut stream: MessageStream, topic: &str, mut handler: H)
where
    H: MessageHandler,
{
    let (relay_tx, mut relay_rx) = mpsc::channel::<InboundMessage>(1);

    let receiver = tokio::spawn(
        async move {
            while let Some(message) = stream.next().await {
                if relay_tx.send(message).await.is_err() {
                    break;
                }
            }
        }
        .instrument(Span::current()),
    );

    while let Some(message) = relay_rx.recv().await {
        debug!(topic, message_id = message.id(), "Relaying message");
        match handler.handle(&message).await {
            Ok(()) => {
                if let Err(err) = message.ack().await {
                    error!(topic, error = %err, "Error acknowledging message");
                }
            }
            Err(err) => {
                warn!(topic, message_id = message.id(), error = %err, "Handler rejected message");
                if let Err(err) = message.nack(true).await {
                    error!(topic, error = %err, "Error rejecting message");
                }
            }
        }
    }

    if let Err(err) = receiver.await {
        error!(topic, error = %err, "Relay task failed");
    }
}

#[async_trait]
impl MessageBroker for RabbitMq {
    fn load_configuration(&self) -> Result<()> {
        RabbitMq::load_configuration(self).map(|_| ())
    }

    async fn subscribe(&self, cancel: CancellationToken) -> Result<()> {
        RabbitMq::subscribe(self, cancel).await
    }

    async fn publish(&self, data: &[u8]) -> Result<String> {
        RabbitMq::publish(self, data).await
    }
}
