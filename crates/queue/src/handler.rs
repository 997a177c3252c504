//! Event handler trait and message decoding.

use async_trait::async_trait;

use vigil_core::MetricsEvent;

use crate::error::QueueError;

/// Receives each successfully decoded event from the consumer.
///
/// Handlers run to completion for every delivery; a returned error counts
/// the message as failed but never requeues it.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: MetricsEvent) -> Result<(), QueueError>;
}

/// Decode a broker message body into a [`MetricsEvent`].
///
/// Bodies are UTF-8 JSON objects following the producer schema.
pub fn decode_event(payload: &[u8]) -> Result<MetricsEvent, QueueError> {
    serde_json::from_slice(payload).map_err(|e| QueueError::Decode(e.to_string()))
}
