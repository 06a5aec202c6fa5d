//! # amqp_bridge
//!
//! `amqp_bridge` lets an application publish to and consume from named topics
//! without tying its business logic to one broker. The working backend speaks
//! AMQP 0-9-1 (RabbitMQ); a Kafka backend is reserved as a placeholder.
//!
//! ## Core Modules
//!
//! - `broker`: the facades (`RabbitMq`, `KafkaMq`), the shared `MessageBroker`
//!   capability and the `Backend` selector.
//! - `config`: settings loading and the `ParameterProvider` seam.
//! - `message`: outbound messages and inbound messages with their
//!   acknowledgement handle.
//! - `topology`: the declarative exchange/queue/binding/publish/consume
//!   description built from configuration.
//! - `transport`: publisher/subscriber traits with an AMQP (`lapin`) and an
//!   in-process implementation.
//! - `utils`: error type and logging bootstrap.

pub mod broker;
pub mod config;
pub mod message;
pub mod topology;
pub mod transport;
pub mod utils;

pub use broker::{Backend, KafkaMq, MessageBroker, MessageHandler, RabbitMq};
pub use utils::{BrokerError, Result};
