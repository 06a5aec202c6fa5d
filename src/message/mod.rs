//! Message definitions
//!
//! `OutboundMessage` is what a publisher sends; `InboundMessage` is what a
//! subscriber yields. Notes on fields:
//! - `id`: unique per publish call, so republishing the same payload after a
//!   failure produces a distinguishable message rather than an idempotent retry
//! - `payload`: opaque bytes, never interpreted by the broker layer
//! - inbound messages carry an acknowledgement handle; `ack`/`nack` consume
//!   the message so the handle can be used at most once

use std::fmt;

use async_trait::async_trait;
use uuid::Uuid;

use crate::utils::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub id: String,
    pub payload: Vec<u8>,
}

impl OutboundMessage {
    /// Wrap a payload with a freshly generated id.
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: new_message_id(),
            payload: payload.into(),
        }
    }
}

pub fn new_message_id() -> String {
    Uuid::new_v4().to_string()
}

/// Transport-side settlement of one delivery.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(self: Box<Self>) -> Result<()>;
    async fn nack(self: Box<Self>, requeue: bool) -> Result<()>;
}

pub struct InboundMessage {
    id: String,
    payload: Vec<u8>,
    acker: Box<dyn Acknowledger>,
}

impl InboundMessage {
    pub fn new(id: String, payload: Vec<u8>, acker: Box<dyn Acknowledger>) -> Self {
        Self { id, payload, acker }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Signal successful processing.
    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }

    /// Reject the message; with `requeue` the broker redelivers it.
    pub async fn nack(self, requeue: bool) -> Result<()> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundMessage")
            .field("id", &self.id)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

#[cfg(test)]
mod tests;
