//! Crate-wide error type.
//!
//! Every component returns these errors to its caller instead of panicking.
//! The variants mirror the failure classes of a broker session:
//! - `Config`: missing or invalid configuration values, never retried
//! - `Connection`: the transport could not be established or the topology
//!   could not be declared
//! - `Subscription` / `Publish`: a topic-level operation failed after the
//!   connection was up
//! - `Acknowledge`: the broker refused an ack/nack
//! - `Unimplemented`: the backend exists only as a placeholder

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BrokerError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("subscription to topic '{topic}' failed: {reason}")]
    Subscription { topic: String, reason: String },

    #[error("publish to topic '{topic}' failed: {reason}")]
    Publish { topic: String, reason: String },

    #[error("acknowledgement failed: {0}")]
    Acknowledge(String),

    #[error("{0} is not implemented yet")]
    Unimplemented(String),
}

impl BrokerError {
    pub fn subscription(topic: &str, reason: impl ToString) -> Self {
        Self::Subscription {
            topic: topic.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn publish(topic: &str, reason: impl ToString) -> Self {
        Self::Publish {
            topic: topic.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Short, stable name of the error class, used as a log field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Connection(_) => "connection",
            Self::Subscription { .. } => "subscription",
            Self::Publish { .. } => "publish",
            Self::Acknowledge(_) => "acknowledge",
            Self::Unimplemented(_) => "unimplemented",
        }
    }
}

impl From<config::ConfigError> for BrokerError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}
