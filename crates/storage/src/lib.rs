pub mod batcher;
pub mod cache;
pub mod error;
pub mod manager;
pub mod rows;

pub use batcher::MetricsBatcher;
pub use cache::MetricsCache;
pub use error::StorageError;
pub use manager::{StorageManager, StorageStats};
pub use rows::{flatten_snapshot, MetricRow, MetricScope};
