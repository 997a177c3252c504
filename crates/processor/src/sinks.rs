//! Alert sinks that bridge to external systems.

use async_trait::async_trait;

use vigil_alerts::{Alert, AlertError, AlertSink};
use vigil_queue::AlertPublisher;

/// Publishes alert transitions to the broker's alerts queue.
pub struct BrokerAlertSink {
    publisher: AlertPublisher,
}

impl BrokerAlertSink {
    pub fn new(publisher: AlertPublisher) -> Self {
        Self { publisher }
    }
}

#[async_trait]
impl AlertSink for BrokerAlertSink {
    async fn notify(&self, alert: &Alert) -> Result<(), AlertError> {
        let payload = serde_json::to_value(alert)
            .map_err(|e| AlertError::Sink(format!("serialize failed: {e}")))?;
        self.publisher
            .publish_json(&payload)
            .await
            .map_err(|e| AlertError::Sink(e.to_string()))
    }

    fn name(&self) -> &str {
        "broker"
    }
}
