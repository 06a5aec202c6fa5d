//! Kafka placeholder.
//!
//! Every operation returns `Unimplemented` straight away: no network, no
//! blocking, no panics.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{Span, info, info_span};

use crate::broker::MessageBroker;
use crate::utils::{BrokerError, Result};

#[derive(Debug, Clone)]
pub struct KafkaMq {
    span: Span,
}

impl Default for KafkaMq {
    fn default() -> Self {
        Self::new()
    }
}

impl KafkaMq {
    pub fn new() -> Self {
        Self {
            span: info_span!("broker", backend = "kafka"),
        }
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    fn not_implemented(&self, operation: &str) -> BrokerError {
        let _enter = self.span.enter();
        info!("Kafka {operation} is not implemented yet.");
        BrokerError::Unimplemented(format!("kafka {operation}"))
    }
}

#[async_trait]
impl MessageBroker for KafkaMq {
    fn load_configuration(&self) -> Result<()> {
        Err(self.not_implemented("configuration"))
    }

    async fn subscribe(&self, _cancel: CancellationToken) -> Result<()> {
        Err(self.not_implemented("subscription"))
    }

    async fn publish(&self, _data: &[u8]) -> Result<String> {
        Err(self.not_implemented("publishing"))
    }
}
