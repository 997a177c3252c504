pub mod handler;
pub mod health;
pub mod processor;
pub mod sinks;

pub use handler::{AggregatorHandler, SharedAggregator};
pub use health::{ComponentHealth, HealthReport};
pub use processor::{Processor, ProcessorStats};
pub use sinks::BrokerAlertSink;
