//! In-process broker
//!
//! `MemoryBroker` keeps exchanges, queues and bindings behind one lock and
//! follows AMQP 0-9-1 routing:
//! - topic exchanges match `*` (one word) and `#` (zero or more words)
//! - the unnamed default exchange routes to the queue named by the key
//! - unroutable messages are dropped, as without the `mandatory` flag
//! - each consumer holds at most `prefetch_count` unacknowledged deliveries
//! - expired messages (queue `x-message-ttl`) are discarded on delivery
//! - a delivery dropped without being settled goes back to the queue head
//!
//! Concurrency note: the lock is never held across an await point. Consumers
//! park on a per-queue `Notify` and re-check the queue after every wakeup.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::message::{Acknowledger, InboundMessage, OutboundMessage};
use crate::topology::{ExchangeKind, TopologyCreation, TopologyDescriptor};
use crate::transport::{MessageStream, Publisher, Subscriber, Transport, until_cancelled};
use crate::utils::{BrokerError, Result};

#[derive(Debug, Clone)]
struct StoredMessage {
    id: String,
    payload: Vec<u8>,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct Exchange {
    kind: ExchangeKind,
    durable: bool,
    bindings: Vec<Binding>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    queue: String,
    pattern: String,
}

#[derive(Debug)]
struct Queue {
    durable: bool,
    auto_delete: bool,
    ttl: Option<Duration>,
    ready: VecDeque<StoredMessage>,
    unacked: usize,
    notify: Arc<Notify>,
}

#[derive(Debug, Default)]
struct State {
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, Queue>,
    offline: bool,
}

/// Handle to a shared in-process broker. Clones see the same state.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// While offline every connection attempt fails.
    pub fn set_offline(&self, offline: bool) {
        if let Ok(mut state) = self.state.lock() {
            state.offline = offline;
        }
    }

    /// Messages waiting in `queue` that have not been delivered.
    pub fn ready_count(&self, queue: &str) -> usize {
        self.lock()
            .ok()
            .and_then(|s| s.queues.get(queue).map(|q| q.ready.len()))
            .unwrap_or(0)
    }

    /// Messages delivered from `queue` and not yet settled.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.lock()
            .ok()
            .and_then(|s| s.queues.get(queue).map(|q| q.unacked))
            .unwrap_or(0)
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.lock().map(|s| s.exchanges.contains_key(name)).unwrap_or(false)
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.lock().map(|s| s.queues.contains_key(name)).unwrap_or(false)
    }

    pub fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        durable: bool,
        passive: bool,
    ) -> std::result::Result<(), String> {
        if name.is_empty() {
            return Err("the default exchange cannot be declared".to_string());
        }
        let mut state = self.lock()?;
        match state.exchanges.get(name) {
            Some(existing) if existing.kind != kind || existing.durable != durable => Err(format!(
                "exchange '{name}' already declared with different properties"
            )),
            Some(_) => Ok(()),
            None if passive => Err(format!("no exchange '{name}'")),
            None => {
                state.exchanges.insert(
                    name.to_string(),
                    Exchange {
                        kind,
                        durable,
                        bindings: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    pub fn declare_queue(
        &self,
        name: &str,
        durable: bool,
        auto_delete: bool,
        ttl: Option<Duration>,
        passive: bool,
    ) -> std::result::Result<(), String> {
        let mut state = self.lock()?;
        match state.queues.get(name) {
            Some(existing) if existing.durable != durable || existing.auto_delete != auto_delete => {
                Err(format!("queue '{name}' already declared with different properties"))
            }
            Some(_) => Ok(()),
            None if passive => Err(format!("no queue '{name}'")),
            None => {
                state.queues.insert(
                    name.to_string(),
                    Queue {
                        durable,
                        auto_delete,
                        ttl,
                        ready: VecDeque::new(),
                        unacked: 0,
                        notify: Arc::new(Notify::new()),
                    },
                );
                Ok(())
            }
        }
    }

    pub fn bind(&self, queue: &str, exchange: &str, pattern: &str) -> std::result::Result<(), String> {
        let mut state = self.lock()?;
        if !state.queues.contains_key(queue) {
            return Err(format!("no queue '{queue}'"));
        }
        let exchange = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| format!("no exchange '{exchange}'"))?;
        let binding = Binding {
            queue: queue.to_string(),
            pattern: pattern.to_string(),
        };
        if !exchange.bindings.contains(&binding) {
            exchange.bindings.push(binding);
        }
        Ok(())
    }

    /// Route a message; returns how many queues received it.
    pub fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> std::result::Result<usize, String> {
        let mut state = self.lock()?;
        let targets: Vec<String> = if exchange.is_empty() {
            vec![routing_key.to_string()]
        } else {
            let ex = state
                .exchanges
                .get(exchange)
                .ok_or_else(|| format!("no exchange '{exchange}'"))?;
            let mut queues: Vec<String> = ex
                .bindings
                .iter()
                .filter(|b| routes(ex.kind, &b.pattern, routing_key))
                .map(|b| b.queue.clone())
                .collect();
            queues.sort();
            queues.dedup();
            queues
        };

        let now = Utc::now();
        let mut delivered = 0;
        for name in targets {
            if let Some(queue) = state.queues.get_mut(&name) {
                let expires_at = queue
                    .ttl
                    .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
                    .map(|ttl| now + ttl);
                queue.ready.push_back(StoredMessage {
                    id: message.id.clone(),
                    payload: message.payload.clone(),
                    expires_at,
                });
                queue.notify.notify_one();
                delivered += 1;
            }
        }
        if delivered == 0 {
            debug!(exchange, routing_key, "Dropped unroutable message");
        }
        Ok(delivered)
    }

    fn lock(&self) -> std::result::Result<MutexGuard<'_, State>, String> {
        self.state
            .lock()
            .map_err(|_| "memory broker state poisoned".to_string())
    }

    fn connect(&self, topology: &TopologyDescriptor) -> Result<()> {
        topology.connection.amqp_uri()?;
        let offline = self
            .lock()
            .map_err(BrokerError::Connection)?
            .offline;
        if offline {
            return Err(BrokerError::Connection("broker unreachable".to_string()));
        }
        Ok(())
    }

    fn notifier(&self, queue: &str) -> Option<Arc<Notify>> {
        self.lock()
            .ok()
            .and_then(|s| s.queues.get(queue).map(|q| q.notify.clone()))
    }

    /// Take the next live message, counting it as unacknowledged.
    /// `None` means the queue is empty; `Err` that it no longer exists.
    fn take(&self, queue: &str) -> std::result::Result<Option<StoredMessage>, String> {
        let mut state = self.lock()?;
        let queue = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| format!("no queue '{queue}'"))?;
        let now = Utc::now();
        while let Some(message) = queue.ready.pop_front() {
            if message.expires_at.is_some_and(|at| at <= now) {
                continue;
            }
            queue.unacked += 1;
            return Ok(Some(message));
        }
        Ok(None)
    }

    fn settle(&self, queue: &str, message: StoredMessage, requeue: bool) {
        let Ok(mut state) = self.lock() else {
            return;
        };
        if let Some(q) = state.queues.get_mut(queue) {
            q.unacked = q.unacked.saturating_sub(1);
            if requeue {
                q.ready.push_front(message);
                q.notify.notify_one();
            }
        }
    }
}

fn routes(kind: ExchangeKind, pattern: &str, routing_key: &str) -> bool {
    match kind {
        ExchangeKind::Fanout => true,
        ExchangeKind::Direct => pattern == routing_key,
        ExchangeKind::Topic => topic_matches(pattern, routing_key),
    }
}

/// AMQP topic matching: `*` is exactly one word, `#` zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    words_match(&pattern, &key)
}

fn words_match(pattern: &[&str], key: &[&str]) -> bool {
    match (pattern.first(), key.first()) {
        (None, None) => true,
        (Some(&"#"), _) => {
            words_match(&pattern[1..], key) || (!key.is_empty() && words_match(pattern, &key[1..]))
        }
        (Some(&"*"), Some(_)) => words_match(&pattern[1..], &key[1..]),
        (Some(p), Some(k)) if p == k => words_match(&pattern[1..], &key[1..]),
        _ => false,
    }
}

struct MemoryAcker {
    broker: MemoryBroker,
    queue: String,
    message: Option<StoredMessage>,
    _permit: OwnedSemaphorePermit,
}

impl MemoryAcker {
    fn finish(&mut self, requeue: bool) {
        if let Some(message) = self.message.take() {
            self.broker.settle(&self.queue, message, requeue);
        }
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(mut self: Box<Self>) -> Result<()> {
        self.finish(false);
        Ok(())
    }

    async fn nack(mut self: Box<Self>, requeue: bool) -> Result<()> {
        self.finish(requeue);
        Ok(())
    }
}

impl Drop for MemoryAcker {
    fn drop(&mut self) {
        self.finish(true);
    }
}

struct Consumer {
    broker: MemoryBroker,
    queue: String,
    notify: Arc<Notify>,
    prefetch: Arc<Semaphore>,
}

impl Consumer {
    async fn next(&self) -> Option<InboundMessage> {
        let permit = self.prefetch.clone().acquire_owned().await.ok()?;
        loop {
            let notified = self.notify.notified();
            match self.broker.take(&self.queue) {
                Ok(Some(message)) => {
                    let acker = MemoryAcker {
                        broker: self.broker.clone(),
                        queue: self.queue.clone(),
                        message: Some(message.clone()),
                        _permit: permit,
                    };
                    return Some(InboundMessage::new(
                        message.id,
                        message.payload,
                        Box::new(acker),
                    ));
                }
                Ok(None) => notified.await,
                Err(_) => return None,
            }
        }
    }
}

/// `Transport` backed by a [`MemoryBroker`].
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    broker: MemoryBroker,
}

impl MemoryTransport {
    pub fn new(broker: MemoryBroker) -> Self {
        Self { broker }
    }

    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open_subscriber(
        &self,
        topology: Arc<TopologyDescriptor>,
    ) -> Result<Box<dyn Subscriber>> {
        self.broker.connect(&topology)?;
        Ok(Box::new(MemorySubscriber {
            broker: self.broker.clone(),
            topology,
        }))
    }

    async fn open_publisher(
        &self,
        topology: Arc<TopologyDescriptor>,
    ) -> Result<Box<dyn Publisher>> {
        self.broker.connect(&topology)?;
        Ok(Box::new(MemoryPublisher {
            broker: self.broker.clone(),
            topology,
        }))
    }
}

struct MemorySubscriber {
    broker: MemoryBroker,
    topology: Arc<TopologyDescriptor>,
}

impl MemorySubscriber {
    fn declare(&self, topic: &str) -> std::result::Result<String, String> {
        let topology = &self.topology;
        let resolved = topology.resolve(topic);
        let passive = topology.creation == TopologyCreation::Existing;

        self.broker.declare_queue(
            &resolved.queue,
            topology.queue.durable,
            topology.queue.auto_delete,
            topology.queue.message_ttl(),
            passive,
        )?;
        if !resolved.exchange.is_empty() {
            self.broker.declare_exchange(
                &resolved.exchange,
                topology.exchange.kind,
                topology.exchange.durable,
                passive,
            )?;
            self.broker
                .bind(&resolved.queue, &resolved.exchange, &resolved.binding_key)?;
        }
        Ok(resolved.queue)
    }
}

#[async_trait]
impl Subscriber for MemorySubscriber {
    async fn subscribe(&mut self, cancel: CancellationToken, topic: &str) -> Result<MessageStream> {
        let queue = self
            .declare(topic)
            .map_err(|e| BrokerError::subscription(topic, e))?;
        let notify = self
            .broker
            .notifier(&queue)
            .ok_or_else(|| BrokerError::subscription(topic, format!("no queue '{queue}'")))?;

        let consumer = Consumer {
            broker: self.broker.clone(),
            queue,
            notify,
            prefetch: Arc::new(Semaphore::new(
                self.topology.consume.prefetch_count.max(1) as usize,
            )),
        };
        let stream = futures::stream::unfold(consumer, |consumer| async move {
            let message = consumer.next().await?;
            Some((message, consumer))
        });
        Ok(until_cancelled(stream, cancel))
    }
}

struct MemoryPublisher {
    broker: MemoryBroker,
    topology: Arc<TopologyDescriptor>,
}

#[async_trait]
impl Publisher for MemoryPublisher {
    async fn publish(&mut self, topic: &str, message: OutboundMessage) -> Result<()> {
        let topology = &self.topology;
        let resolved = topology.resolve(topic);

        if !resolved.exchange.is_empty() {
            self.broker
                .declare_exchange(
                    &resolved.exchange,
                    topology.exchange.kind,
                    topology.exchange.durable,
                    topology.creation == TopologyCreation::Existing,
                )
                .map_err(|e| BrokerError::publish(topic, e))?;
        }
        self.broker
            .publish(&resolved.exchange, &resolved.publish_key, message)
            .map_err(|e| BrokerError::publish(topic, e))?;
        Ok(())
    }
}
