//! Queue error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("message decode error: {0}")]
    Decode(String),

    #[error("acknowledge error: {0}")]
    Ack(String),

    #[error("publish error: {0}")]
    Publish(String),

    #[error("handler error: {0}")]
    Handler(String),
}
