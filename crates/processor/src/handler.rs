//! Consumer-to-aggregator bridge.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use vigil_aggregator::SlidingWindow;
use vigil_core::MetricsEvent;
use vigil_queue::{EventHandler, QueueError};

/// The aggregator state shared between the event handler (single writer)
/// and the periodic snapshot readers. The lock is held only across the
/// non-suspending aggregator calls.
pub type SharedAggregator = Arc<RwLock<SlidingWindow>>;

/// Feeds each decoded event into the sliding window.
pub struct AggregatorHandler {
    aggregator: SharedAggregator,
}

impl AggregatorHandler {
    pub fn new(aggregator: SharedAggregator) -> Self {
        Self { aggregator }
    }
}

#[async_trait]
impl EventHandler for AggregatorHandler {
    async fn handle(&self, event: MetricsEvent) -> Result<(), QueueError> {
        let mut window = self
            .aggregator
            .write()
            .map_err(|_| QueueError::Handler("aggregator lock poisoned".to_string()))?;
        window.add_event(&event);
        Ok(())
    }
}
