//! Per-component health aggregation.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use vigil_aggregator::AggregatorStats;
use vigil_alerts::AlertStats;
use vigil_queue::{ConsumerState, ConsumerStats};
use vigil_storage::StorageStats;

/// Health of one component with its raw statistics attached.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub healthy: bool,
    pub stats: serde_json::Value,
}

/// Aggregated pipeline health, produced by the 30s health tick.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub overall_healthy: bool,
    pub timestamp: DateTime<Utc>,
    pub components: BTreeMap<String, ComponentHealth>,
}

impl HealthReport {
    /// Assemble a report from component statistics.
    ///
    /// The consumer is healthy while consuming; storage is healthy while
    /// its most recent write reached the store; the aggregator and alert
    /// manager have no external dependencies and report their counters.
    pub fn build(
        consumer: &ConsumerStats,
        aggregator: &AggregatorStats,
        storage: Option<&StorageStats>,
        alerts: &AlertStats,
        now: DateTime<Utc>,
    ) -> Self {
        let mut components = BTreeMap::new();

        let consumer_healthy = consumer.state == ConsumerState::Consuming;
        components.insert(
            "event_consumer".to_string(),
            ComponentHealth {
                healthy: consumer_healthy,
                stats: serde_json::to_value(consumer).unwrap_or_default(),
            },
        );

        components.insert(
            "aggregator".to_string(),
            ComponentHealth {
                healthy: true,
                stats: serde_json::to_value(aggregator).unwrap_or_default(),
            },
        );

        let storage_healthy = match storage {
            Some(stats) => stats.last_write_ok,
            None => false,
        };
        components.insert(
            "storage_manager".to_string(),
            ComponentHealth {
                healthy: storage_healthy,
                stats: storage
                    .map(|s| serde_json::to_value(s).unwrap_or_default())
                    .unwrap_or_default(),
            },
        );

        components.insert(
            "alert_manager".to_string(),
            ComponentHealth {
                healthy: true,
                stats: serde_json::to_value(alerts).unwrap_or_default(),
            },
        );

        HealthReport {
            overall_healthy: components.values().all(|c| c.healthy),
            timestamp: now,
            components,
        }
    }
}
