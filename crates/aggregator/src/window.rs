//! Sliding-window aggregation.
//!
//! Events are bucketized into fixed-width sub-windows aligned to
//! `sub_window_seconds` boundaries. The window is the union of the most
//! recent `window_size / sub_window` buckets; older buckets are evicted as
//! event time advances. No I/O, no blocking — callers own synchronization.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use tracing::debug;

use vigil_core::MetricsEvent;

use crate::snapshot::{EndpointKey, ScopeMetrics, Snapshot};

// ── Per-bucket accumulators ──────────────────────────────────────────

/// Counts and latency samples accumulated for one scope inside one bucket.
#[derive(Debug, Clone, Default)]
struct BucketStats {
    requests: u64,
    errors: u64,
    latencies: Vec<f64>,
}

impl BucketStats {
    fn record(&mut self, is_error: bool, latency: Option<f64>) {
        self.requests += 1;
        if is_error {
            self.errors += 1;
        }
        if let Some(ms) = latency {
            self.latencies.push(ms);
        }
    }
}

/// One half-open time bucket `[start, start + sub_seconds)`.
#[derive(Debug, Clone)]
struct SubWindow {
    start: DateTime<Utc>,
    overall: BucketStats,
    services: HashMap<String, BucketStats>,
    endpoints: HashMap<EndpointKey, BucketStats>,
}

impl SubWindow {
    fn new(start: DateTime<Utc>) -> Self {
        Self {
            start,
            overall: BucketStats::default(),
            services: HashMap::new(),
            endpoints: HashMap::new(),
        }
    }

    fn record(&mut self, event: &MetricsEvent) {
        let is_error = event.is_error();
        let latency = event.latency_sample();

        self.overall.record(is_error, latency);
        self.services
            .entry(event.service_name.clone())
            .or_default()
            .record(is_error, latency);
        self.endpoints
            .entry(EndpointKey::new(
                event.service_name.clone(),
                event.endpoint.clone(),
            ))
            .or_default()
            .record(is_error, latency);
    }
}

// ── Aggregator stats ─────────────────────────────────────────────────

/// Runtime counters exposed for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct AggregatorStats {
    pub total_events_processed: u64,
    /// Events skipped because they were not `api_response`.
    pub ignored_events: u64,
    /// Events dropped because they fell outside the live window.
    pub dropped_events: u64,
    pub live_buckets: usize,
    pub max_buckets: usize,
    pub window_size_seconds: u32,
    pub sub_window_seconds: u32,
    pub current_bucket_start: Option<DateTime<Utc>>,
}

// ── SlidingWindow ────────────────────────────────────────────────────

/// The sliding-window aggregator state.
///
/// Single-writer (the event handler), multi-reader (`snapshot` callers);
/// the owner guards it with a reader/writer lock held only across the
/// non-suspending calls here.
#[derive(Debug)]
pub struct SlidingWindow {
    window_seconds: u32,
    sub_seconds: u32,
    max_buckets: usize,
    /// Sealed buckets in ascending start order.
    sealed: VecDeque<SubWindow>,
    /// The still-open bucket, always newer than everything in `sealed`.
    current: Option<SubWindow>,
    total_events: u64,
    ignored_events: u64,
    dropped_events: u64,
}

impl SlidingWindow {
    /// Create an aggregator; `sub_window_seconds` must divide
    /// `window_size_seconds` (validated by config).
    pub fn new(window_size_seconds: u32, sub_window_seconds: u32) -> Self {
        debug_assert!(sub_window_seconds > 0);
        debug_assert_eq!(window_size_seconds % sub_window_seconds, 0);
        Self {
            window_seconds: window_size_seconds,
            sub_seconds: sub_window_seconds,
            max_buckets: (window_size_seconds / sub_window_seconds) as usize,
            sealed: VecDeque::new(),
            current: None,
            total_events: 0,
            ignored_events: 0,
            dropped_events: 0,
        }
    }

    /// Align a timestamp down to its bucket boundary.
    fn bucket_start(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let secs = at.timestamp();
        let aligned = secs.div_euclid(self.sub_seconds as i64) * self.sub_seconds as i64;
        Utc.timestamp_opt(aligned, 0).single().unwrap_or(at)
    }

    /// Ingest one event. Returns `true` when the event was aggregated.
    ///
    /// Non-response events and events older than every live bucket are
    /// counted and discarded. An event newer than the current bucket seals
    /// it, evicts expired buckets, and opens a new one immediately.
    pub fn add_event(&mut self, event: &MetricsEvent) -> bool {
        if !event.is_response() {
            self.ignored_events += 1;
            return false;
        }

        let start = self.bucket_start(event.timestamp);

        let accepted = match self.current.as_ref().map(|b| b.start) {
            None => {
                let mut bucket = SubWindow::new(start);
                bucket.record(event);
                self.current = Some(bucket);
                true
            }
            Some(current_start) if start == current_start => {
                if let Some(current) = self.current.as_mut() {
                    current.record(event);
                }
                true
            }
            Some(current_start) if start > current_start => {
                if let Some(sealed) = self.current.take() {
                    self.sealed.push_back(sealed);
                }
                self.evict(start);

                debug!(bucket_start = %start, "opening new sub-window");
                let mut bucket = SubWindow::new(start);
                bucket.record(event);
                self.current = Some(bucket);
                true
            }
            Some(_) => {
                // Late arrival: land it in its sealed bucket if still live.
                match self.sealed.iter_mut().rev().find(|b| b.start == start) {
                    Some(bucket) => {
                        bucket.record(event);
                        true
                    }
                    None => {
                        self.dropped_events += 1;
                        debug!(event_id = %event.event_id, "event outside live window, dropped");
                        false
                    }
                }
            }
        };

        if accepted {
            self.total_events += 1;
        }
        accepted
    }

    /// Drop sealed buckets that fall outside the window ending at the new
    /// current bucket.
    fn evict(&mut self, new_start: DateTime<Utc>) {
        let cutoff = new_start.timestamp() - self.window_seconds as i64;
        while let Some(front) = self.sealed.front() {
            if front.start.timestamp() <= cutoff {
                self.sealed.pop_front();
            } else {
                break;
            }
        }
        // The current bucket occupies one of the max_buckets slots.
        while self.sealed.len() > self.max_buckets.saturating_sub(1) {
            self.sealed.pop_front();
        }
    }

    fn live(&self) -> impl Iterator<Item = &SubWindow> {
        self.sealed.iter().chain(self.current.iter())
    }

    /// Number of live buckets (sealed + current).
    pub fn live_buckets(&self) -> usize {
        self.sealed.len() + usize::from(self.current.is_some())
    }

    /// Start times of all live buckets in ascending order.
    pub fn bucket_starts(&self) -> Vec<DateTime<Utc>> {
        self.live().map(|b| b.start).collect()
    }

    /// Compute a consistent point-in-time [`Snapshot`] over all live buckets.
    pub fn snapshot(&self, now: DateTime<Utc>) -> Snapshot {
        if self.live_buckets() == 0 {
            return Snapshot::empty(now, self.window_seconds);
        }

        let mut requests = 0u64;
        let mut errors = 0u64;
        let mut latencies: Vec<f64> = Vec::new();
        let mut services: HashMap<String, (u64, u64, Vec<f64>)> = HashMap::new();
        let mut endpoints: HashMap<EndpointKey, (u64, u64, Vec<f64>)> = HashMap::new();

        for bucket in self.live() {
            requests += bucket.overall.requests;
            errors += bucket.overall.errors;
            latencies.extend_from_slice(&bucket.overall.latencies);

            for (name, stats) in &bucket.services {
                let entry = services.entry(name.clone()).or_default();
                entry.0 += stats.requests;
                entry.1 += stats.errors;
                entry.2.extend_from_slice(&stats.latencies);
            }
            for (key, stats) in &bucket.endpoints {
                let entry = endpoints.entry(key.clone()).or_default();
                entry.0 += stats.requests;
                entry.1 += stats.errors;
                entry.2.extend_from_slice(&stats.latencies);
            }
        }

        let window_seconds = self.window_seconds;
        Snapshot {
            timestamp: now,
            window_start: now - chrono::Duration::seconds(window_seconds as i64),
            window_end: now,
            window_size_seconds: window_seconds,
            active_buckets: self.live_buckets(),
            overall: ScopeMetrics::compute(requests, errors, &mut latencies, window_seconds),
            services: services
                .into_iter()
                .map(|(name, (req, err, mut lat))| {
                    (name, ScopeMetrics::compute(req, err, &mut lat, window_seconds))
                })
                .collect(),
            endpoints: endpoints
                .into_iter()
                .map(|(key, (req, err, mut lat))| {
                    (key, ScopeMetrics::compute(req, err, &mut lat, window_seconds))
                })
                .collect(),
        }
    }

    /// Runtime counters for health reporting.
    pub fn stats(&self) -> AggregatorStats {
        AggregatorStats {
            total_events_processed: self.total_events,
            ignored_events: self.ignored_events,
            dropped_events: self.dropped_events,
            live_buckets: self.live_buckets(),
            max_buckets: self.max_buckets,
            window_size_seconds: self.window_seconds,
            sub_window_seconds: self.sub_seconds,
            current_bucket_start: self.current.as_ref().map(|b| b.start),
        }
    }
}
