//! The `transport` module opens publishers and subscribers for a topology.
//!
//! A [`Transport`] is the seam between a facade and a concrete client:
//! - [`amqp::AmqpTransport`] talks AMQP 0-9-1 through `lapin`
//! - [`memory::MemoryTransport`] routes inside the process; it keeps the same
//!   exchange/queue/prefetch semantics and backs the test suite
//!
//! Subscribing yields a [`MessageStream`]: lazy, unbounded and in order. It
//! only pulls from the broker when polled and ends, without error, once the
//! cancellation token passed to `subscribe` fires.

pub mod amqp;
pub mod memory;

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::message::{InboundMessage, OutboundMessage};
use crate::topology::TopologyDescriptor;
use crate::utils::Result;

pub use amqp::AmqpTransport;
pub use memory::{MemoryBroker, MemoryTransport};

pub type MessageStream = Pin<Box<dyn Stream<Item = InboundMessage> + Send>>;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish a connection for consuming. Fails with `Connection`.
    async fn open_subscriber(
        &self,
        topology: Arc<TopologyDescriptor>,
    ) -> Result<Box<dyn Subscriber>>;

    /// Establish a connection for publishing. Fails with `Connection`.
    async fn open_publisher(&self, topology: Arc<TopologyDescriptor>)
    -> Result<Box<dyn Publisher>>;
}

#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Declare the topology for `topic` (when auto-creation is on) and start
    /// consuming. Fails with `Subscription`.
    async fn subscribe(&mut self, cancel: CancellationToken, topic: &str) -> Result<MessageStream>;
}

#[async_trait]
pub trait Publisher: Send + Sync {
    /// Send one message and wait until the broker has accepted it.
    /// Fails with `Publish`.
    async fn publish(&mut self, topic: &str, message: OutboundMessage) -> Result<()>;
}

/// End `stream` as soon as `cancel` fires.
pub(crate) fn until_cancelled<S>(stream: S, cancel: CancellationToken) -> MessageStream
where
    S: Stream<Item = InboundMessage> + Send + 'static,
{
    Box::pin(stream.take_until(async move { cancel.cancelled().await }))
}
