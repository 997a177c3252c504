pub mod snapshot;
pub mod window;

pub use snapshot::{EndpointKey, ScopeMetrics, Snapshot};
pub use window::{AggregatorStats, SlidingWindow};
