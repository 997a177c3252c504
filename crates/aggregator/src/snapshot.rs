//! Derived metrics types.
//!
//! A [`Snapshot`] is the immutable point-in-time view computed over all live
//! sub-windows, at three scopes: overall, per-service, and per-endpoint.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Round to two decimal places for emitted metric values.
pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Linearly-interpolated percentile over a sorted sample.
///
/// For percentile `p`, `k = (n - 1) * p / 100` and the result interpolates
/// between the neighbouring ranks. Empty samples yield zero; a single sample
/// yields itself.
pub(crate) fn percentile(sorted: &[f64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let k = (sorted.len() - 1) as f64 * pct / 100.0;
    let floor = k.floor() as usize;
    let ceil = floor + 1;
    if ceil >= sorted.len() {
        return sorted[sorted.len() - 1];
    }
    sorted[floor] + (k - floor as f64) * (sorted[ceil] - sorted[floor])
}

// ── EndpointKey ──────────────────────────────────────────────────────

/// Identifies one endpoint within one service.
///
/// Serialized as `"service:endpoint"` — the form used for cache keys and
/// by producers — but a typed pair everywhere in-process.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EndpointKey {
    pub service: String,
    pub endpoint: String,
}

impl EndpointKey {
    pub fn new(service: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            endpoint: endpoint.into(),
        }
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.service, self.endpoint)
    }
}

impl FromStr for EndpointKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((service, endpoint)) => Ok(Self::new(service, endpoint)),
            None => Err(format!("endpoint key '{s}' missing ':' separator")),
        }
    }
}

impl Serialize for EndpointKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EndpointKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

// ── ScopeMetrics ─────────────────────────────────────────────────────

/// Metrics for one scope (overall, a service, or an endpoint) over the
/// full window. All rates and latencies are rounded to two decimals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScopeMetrics {
    pub qps: f64,
    /// Error percentage in `[0, 100]`; zero when there are no requests.
    pub error_rate: f64,
    pub avg_response_time: f64,
    pub p95_response_time: f64,
    pub p99_response_time: f64,
    pub total_requests: u64,
    pub total_errors: u64,
}

impl ScopeMetrics {
    /// Compute scope metrics from accumulated counts and latency samples.
    ///
    /// Sorts `latencies` in place; QPS is averaged over the whole window,
    /// not the populated buckets.
    pub(crate) fn compute(
        requests: u64,
        errors: u64,
        latencies: &mut Vec<f64>,
        window_seconds: u32,
    ) -> Self {
        latencies.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));

        let error_rate = if requests == 0 {
            0.0
        } else {
            round2(errors as f64 / requests as f64 * 100.0)
        };
        let avg = if latencies.is_empty() {
            0.0
        } else {
            round2(latencies.iter().sum::<f64>() / latencies.len() as f64)
        };

        Self {
            qps: round2(requests as f64 / window_seconds as f64),
            error_rate,
            avg_response_time: avg,
            p95_response_time: round2(percentile(latencies, 95.0)),
            p99_response_time: round2(percentile(latencies, 99.0)),
            total_requests: requests,
            total_errors: errors,
        }
    }
}

// ── Snapshot ─────────────────────────────────────────────────────────

/// Immutable derived metrics for one observation instant.
///
/// Owned by the caller once produced; downstream consumers (storage, alert
/// evaluation) only read it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub timestamp: DateTime<Utc>,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub window_size_seconds: u32,
    pub active_buckets: usize,
    pub overall: ScopeMetrics,
    pub services: BTreeMap<String, ScopeMetrics>,
    pub endpoints: BTreeMap<EndpointKey, ScopeMetrics>,
}

impl Snapshot {
    /// Well-defined zeroed snapshot for an empty window.
    pub fn empty(now: DateTime<Utc>, window_size_seconds: u32) -> Self {
        Self {
            timestamp: now,
            window_start: now - chrono::Duration::seconds(window_size_seconds as i64),
            window_end: now,
            window_size_seconds,
            active_buckets: 0,
            overall: ScopeMetrics::default(),
            services: BTreeMap::new(),
            endpoints: BTreeMap::new(),
        }
    }
}
