pub mod consumer;
pub mod error;
pub mod handler;
pub mod publisher;

pub use consumer::{ConsumerState, ConsumerStats, MetricsConsumer};
pub use error::QueueError;
pub use handler::{decode_event, EventHandler};
pub use publisher::AlertPublisher;
