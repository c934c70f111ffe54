use thiserror::Error;

use crate::JsonEnvelope;

/// Failure reported by a subscriber.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The payload did not deserialize into the type the subscriber expects.
    #[error("failed to decode event payload: {0}")]
    Decode(#[from] serde_json::Error),

    /// The subscriber's own side effect failed.
    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

/// A subscriber to committed domain events.
///
/// Handlers are invoked one at a time, in registration order, after the store
/// write that produced the event is durable. Delivery is at-least-once: an event
/// whose dispatch failed part-way is redelivered by the outbox relay, so
/// handlers must be idempotent.
///
/// Handlers see every event; filter on [`crate::EventEnvelope::event_type`] and
/// ignore the rest.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync {
    /// Stable name used in logs and dispatch errors.
    fn name(&self) -> &'static str;

    async fn handle(&self, envelope: &JsonEnvelope) -> Result<(), HandlerError>;
}
