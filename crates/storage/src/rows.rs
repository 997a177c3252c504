//! Snapshot flattening for the time-series table.
//!
//! Each snapshot becomes N+1 rows: one overall row, one per service, one
//! per endpoint. Rows carry the scope in `metric_type` with the scope
//! identifiers in the nullable `service_name`/`endpoint` columns.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;

use vigil_aggregator::{ScopeMetrics, Snapshot};

/// Which scope a row aggregates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricScope {
    Overall,
    Service,
    Endpoint,
}

impl MetricScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricScope::Overall => "overall",
            MetricScope::Service => "service",
            MetricScope::Endpoint => "endpoint",
        }
    }
}

/// One row of the `metrics_aggregated` table.
#[derive(Debug, Clone, Serialize)]
pub struct MetricRow {
    pub timestamp: DateTime<Utc>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub service_name: Option<String>,
    pub endpoint: Option<String>,
    pub metric_type: MetricScope,
    pub qps: f64,
    pub error_rate: f64,
    pub avg_response_time: f64,
    pub p95_response_time: f64,
    pub p99_response_time: f64,
    pub total_requests: i64,
    pub total_errors: i64,
    pub additional_data: serde_json::Value,
}

impl MetricRow {
    fn from_scope(
        snapshot: &Snapshot,
        metrics: &ScopeMetrics,
        metric_type: MetricScope,
        service_name: Option<String>,
        endpoint: Option<String>,
        additional_data: serde_json::Value,
    ) -> Self {
        Self {
            timestamp: snapshot.timestamp,
            window_start: snapshot.window_start,
            window_end: snapshot.window_end,
            service_name,
            endpoint,
            metric_type,
            qps: metrics.qps,
            error_rate: metrics.error_rate,
            avg_response_time: metrics.avg_response_time,
            p95_response_time: metrics.p95_response_time,
            p99_response_time: metrics.p99_response_time,
            total_requests: metrics.total_requests as i64,
            total_errors: metrics.total_errors as i64,
            additional_data,
        }
    }
}

/// Flatten a snapshot into its table rows.
pub fn flatten_snapshot(snapshot: &Snapshot) -> Vec<MetricRow> {
    let mut rows = Vec::with_capacity(1 + snapshot.services.len() + snapshot.endpoints.len());

    rows.push(MetricRow::from_scope(
        snapshot,
        &snapshot.overall,
        MetricScope::Overall,
        None,
        None,
        json!({
            "active_buckets": snapshot.active_buckets,
            "window_size_seconds": snapshot.window_size_seconds,
        }),
    ));

    for (service, metrics) in &snapshot.services {
        rows.push(MetricRow::from_scope(
            snapshot,
            metrics,
            MetricScope::Service,
            Some(service.clone()),
            None,
            json!({}),
        ));
    }

    for (key, metrics) in &snapshot.endpoints {
        rows.push(MetricRow::from_scope(
            snapshot,
            metrics,
            MetricScope::Endpoint,
            Some(key.service.clone()),
            Some(key.endpoint.clone()),
            json!({}),
        ));
    }

    rows
}
