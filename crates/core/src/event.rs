//! Telemetry event model.
//!
//! One [`MetricsEvent`] is emitted per observed request by the instrumented
//! model servers and delivered through the broker as a JSON message.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Kind of telemetry event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ApiRequest,
    ApiResponse,
    ApiError,
    SystemHealth,
}

fn default_event_id() -> String {
    Uuid::new_v4().to_string()
}

/// A single per-request telemetry event.
///
/// Only `api_response` events contribute to aggregates. An event with
/// `status_code >= 400` counts as an error; an event without
/// `response_time_ms` contributes to request counts but not to latency
/// statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsEvent {
    /// Unique event token. Generated when the producer omitted it.
    #[serde(default = "default_event_id")]
    pub event_id: String,
    pub event_type: EventType,
    /// Event wall-clock time (UTC).
    pub timestamp: DateTime<Utc>,
    /// Service name; may carry a model version suffix added at ingest.
    pub service_name: String,
    /// Request path.
    #[serde(rename = "api_endpoint")]
    pub endpoint: String,
    pub http_method: String,
    pub status_code: u16,
    #[serde(default)]
    pub response_time_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_size_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_size_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    /// Free-form producer metadata, passed through untouched.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl MetricsEvent {
    /// Whether this event counts as an error.
    pub fn is_error(&self) -> bool {
        self.status_code >= 400
    }

    /// Whether this event contributes to aggregated metrics.
    pub fn is_response(&self) -> bool {
        self.event_type == EventType::ApiResponse
    }

    /// Latency sample, if present and usable for statistics.
    ///
    /// Negative or non-finite values still count as requests but are
    /// excluded from latency math.
    pub fn latency_sample(&self) -> Option<f64> {
        self.response_time_ms
            .filter(|v| v.is_finite() && *v >= 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_json() -> &'static str {
        r#"{
            "event_id": "evt-001",
            "event_type": "api_response",
            "timestamp": "2025-06-14T12:00:00Z",
            "service_name": "model-a",
            "api_endpoint": "/v1/predict",
            "http_method": "POST",
            "status_code": 200,
            "response_time_ms": 42.5,
            "trace_id": "trace-xyz"
        }"#
    }

    #[test]
    fn test_decode_full_event() {
        let event: MetricsEvent = serde_json::from_str(sample_json()).unwrap();
        assert_eq!(event.event_id, "evt-001");
        assert_eq!(event.event_type, EventType::ApiResponse);
        assert_eq!(event.service_name, "model-a");
        assert_eq!(event.endpoint, "/v1/predict");
        assert_eq!(event.status_code, 200);
        assert_eq!(event.response_time_ms, Some(42.5));
        assert_eq!(event.trace_id.as_deref(), Some("trace-xyz"));
        assert_eq!(
            event.timestamp,
            Utc.with_ymd_and_hms(2025, 6, 14, 12, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_decode_generates_missing_event_id() {
        let body = r#"{
            "event_type": "api_response",
            "timestamp": "2025-06-14T12:00:00Z",
            "service_name": "model-a",
            "api_endpoint": "/v1/predict",
            "http_method": "POST",
            "status_code": 200,
            "response_time_ms": 10.0
        }"#;
        let event: MetricsEvent = serde_json::from_str(body).unwrap();
        assert!(!event.event_id.is_empty());
        assert!(Uuid::parse_str(&event.event_id).is_ok());
    }

    #[test]
    fn test_missing_response_time_is_none() {
        let body = r#"{
            "event_type": "api_response",
            "timestamp": "2025-06-14T12:00:00Z",
            "service_name": "model-a",
            "api_endpoint": "/v1/predict",
            "http_method": "GET",
            "status_code": 204
        }"#;
        let event: MetricsEvent = serde_json::from_str(body).unwrap();
        assert_eq!(event.response_time_ms, None);
        assert_eq!(event.latency_sample(), None);
    }

    #[test]
    fn test_is_error_boundary() {
        let mut event: MetricsEvent = serde_json::from_str(sample_json()).unwrap();
        event.status_code = 399;
        assert!(!event.is_error());
        event.status_code = 400;
        assert!(event.is_error());
        event.status_code = 500;
        assert!(event.is_error());
    }

    #[test]
    fn test_latency_sample_rejects_bad_values() {
        let mut event: MetricsEvent = serde_json::from_str(sample_json()).unwrap();
        event.response_time_ms = Some(-5.0);
        assert_eq!(event.latency_sample(), None);
        event.response_time_ms = Some(f64::NAN);
        assert_eq!(event.latency_sample(), None);
        event.response_time_ms = Some(f64::INFINITY);
        assert_eq!(event.latency_sample(), None);
        event.response_time_ms = Some(0.0);
        assert_eq!(event.latency_sample(), Some(0.0));
    }

    #[test]
    fn test_serde_roundtrip_preserves_required_fields() {
        let event: MetricsEvent = serde_json::from_str(sample_json()).unwrap();
        let encoded = serde_json::to_string(&event).unwrap();
        let decoded: MetricsEvent = serde_json::from_str(&encoded).unwrap();

        assert_eq!(decoded.event_id, event.event_id);
        assert_eq!(decoded.event_type, event.event_type);
        assert_eq!(decoded.timestamp, event.timestamp);
        assert_eq!(decoded.service_name, event.service_name);
        assert_eq!(decoded.endpoint, event.endpoint);
        assert_eq!(decoded.http_method, event.http_method);
        assert_eq!(decoded.status_code, event.status_code);
        assert_eq!(decoded.response_time_ms, event.response_time_ms);
    }

    #[test]
    fn test_endpoint_uses_wire_name() {
        let event: MetricsEvent = serde_json::from_str(sample_json()).unwrap();
        let encoded = serde_json::to_value(&event).unwrap();
        assert!(encoded.get("api_endpoint").is_some());
        assert!(encoded.get("endpoint").is_none());
    }

    #[test]
    fn test_metadata_passthrough() {
        let body = r#"{
            "event_type": "api_error",
            "timestamp": "2025-06-14T12:00:00Z",
            "service_name": "model-b",
            "api_endpoint": "/v1/embed",
            "http_method": "POST",
            "status_code": 503,
            "response_time_ms": 12.0,
            "error_message": "upstream timeout",
            "metadata": {"model_version": "v2", "gpu": 0}
        }"#;
        let event: MetricsEvent = serde_json::from_str(body).unwrap();
        assert_eq!(event.event_type, EventType::ApiError);
        assert_eq!(event.metadata["model_version"], "v2");
        assert_eq!(event.metadata["gpu"], 0);
    }
}
