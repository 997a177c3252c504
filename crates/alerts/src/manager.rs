//! Alert rule evaluation and lifecycle.
//!
//! On every check the manager evaluates each enabled rule against the
//! scopes it targets and drives active alerts through
//! `triggered → (acknowledged →) resolved`. Evaluation is non-suspending;
//! sink notifications happen after the state lock is released.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use vigil_aggregator::{ScopeMetrics, Snapshot};
use vigil_core::config::AlertThresholds;
use vigil_core::Clock;

use crate::sink::AlertSink;
use crate::types::{
    Alert, AlertIdentity, AlertRule, AlertSeverity, AlertStatus, RuleMetric, RuleOperator,
};

/// Bounded alert history; oldest entries are evicted.
const MAX_HISTORY: usize = 1000;

// ── Reporting types ──────────────────────────────────────────────────

/// Aggregate view of current alerting state.
#[derive(Debug, Clone, Serialize)]
pub struct AlertSummary {
    pub active_count: usize,
    pub active_by_severity: BTreeMap<String, usize>,
    pub total_rules: usize,
    pub enabled_rules: usize,
    pub total_triggered: u64,
    pub total_resolved: u64,
}

/// Runtime counters for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct AlertStats {
    pub checks_performed: u64,
    pub last_check: Option<DateTime<Utc>>,
    pub total_triggered: u64,
    pub total_resolved: u64,
    pub active_count: usize,
    pub history_len: usize,
}

// ── Manager ──────────────────────────────────────────────────────────

#[derive(Default)]
struct Inner {
    rules: HashMap<String, AlertRule>,
    active: HashMap<AlertIdentity, Alert>,
    history: VecDeque<Alert>,
    checks_performed: u64,
    last_check: Option<DateTime<Utc>>,
    total_triggered: u64,
    total_resolved: u64,
}

/// Owns the rule set and the active-alert map.
pub struct AlertManager {
    inner: Mutex<Inner>,
    sinks: Vec<Arc<dyn AlertSink>>,
    clock: Arc<dyn Clock>,
}

impl AlertManager {
    /// Create a manager with an empty rule set.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            sinks: Vec::new(),
            clock,
        }
    }

    /// Create a manager pre-loaded with the built-in rule set.
    pub fn with_default_rules(clock: Arc<dyn Clock>, thresholds: &AlertThresholds) -> Self {
        let manager = Self::new(clock);
        for rule in default_rules(thresholds, manager.clock.now()) {
            manager.upsert_rule(rule);
        }
        manager
    }

    /// Register a notification sink. Call before starting evaluation.
    pub fn add_sink(&mut self, sink: Arc<dyn AlertSink>) {
        self.sinks.push(sink);
    }

    /// Insert or replace a rule.
    pub fn upsert_rule(&self, rule: AlertRule) {
        let mut inner = self.inner.lock().expect("alert state lock poisoned");
        if inner.rules.insert(rule.id.clone(), rule).is_some() {
            debug!("alert rule replaced");
        }
    }

    /// Remove a rule. Active alerts for it resolve on the next check that
    /// no longer matches, or stay until explicitly handled.
    pub fn remove_rule(&self, rule_id: &str) -> bool {
        let mut inner = self.inner.lock().expect("alert state lock poisoned");
        inner.rules.remove(rule_id).is_some()
    }

    /// Enable or disable a rule in place.
    pub fn set_rule_enabled(&self, rule_id: &str, enabled: bool) -> bool {
        let mut inner = self.inner.lock().expect("alert state lock poisoned");
        match inner.rules.get_mut(rule_id) {
            Some(rule) => {
                rule.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// All configured rules.
    pub fn rules(&self) -> Vec<AlertRule> {
        let inner = self.inner.lock().expect("alert state lock poisoned");
        inner.rules.values().cloned().collect()
    }

    /// Evaluate every enabled rule against the snapshot and notify sinks
    /// of each transition.
    ///
    /// An empty snapshot (no live buckets) short-circuits: a cold-started
    /// pipeline must not page for low QPS before any traffic arrives.
    pub async fn check_snapshot(&self, snapshot: &Snapshot) {
        let transitions = {
            let mut inner = self.inner.lock().expect("alert state lock poisoned");
            let now = self.clock.now();
            inner.checks_performed += 1;
            inner.last_check = Some(now);

            if snapshot.active_buckets == 0 {
                debug!("empty snapshot, skipping rule evaluation");
                Vec::new()
            } else {
                evaluate_rules(&mut inner, snapshot, now)
            }
        };

        for alert in &transitions {
            self.notify_sinks(alert).await;
        }
    }

    async fn notify_sinks(&self, alert: &Alert) {
        for sink in &self.sinks {
            if let Err(e) = sink.notify(alert).await {
                warn!(
                    sink = sink.name(),
                    alert_id = %alert.id,
                    error = %e,
                    "alert sink delivery failed"
                );
            }
        }
    }

    /// Mark an active alert as acknowledged. It stays in the active map
    /// and still resolves when its condition clears.
    pub fn acknowledge(&self, alert_id: &str) -> bool {
        let mut inner = self.inner.lock().expect("alert state lock poisoned");
        let now = self.clock.now();
        match inner.active.values_mut().find(|a| a.id == alert_id) {
            Some(alert) => {
                alert.status = AlertStatus::Acknowledged;
                alert.acknowledged_at = Some(now);
                true
            }
            None => false,
        }
    }

    /// All currently active (non-resolved) alerts.
    pub fn active_alerts(&self) -> Vec<Alert> {
        let inner = self.inner.lock().expect("alert state lock poisoned");
        inner.active.values().cloned().collect()
    }

    /// Most recent alerts, newest first.
    pub fn history(&self, limit: usize) -> Vec<Alert> {
        let inner = self.inner.lock().expect("alert state lock poisoned");
        inner.history.iter().rev().take(limit).cloned().collect()
    }

    /// Aggregate alerting state.
    pub fn summary(&self) -> AlertSummary {
        let inner = self.inner.lock().expect("alert state lock poisoned");

        let mut by_severity: BTreeMap<String, usize> = BTreeMap::new();
        for severity in [
            AlertSeverity::Low,
            AlertSeverity::Medium,
            AlertSeverity::High,
            AlertSeverity::Critical,
        ] {
            by_severity.insert(severity.to_string(), 0);
        }
        for alert in inner.active.values() {
            *by_severity.entry(alert.severity.to_string()).or_default() += 1;
        }

        AlertSummary {
            active_count: inner.active.len(),
            active_by_severity: by_severity,
            total_rules: inner.rules.len(),
            enabled_rules: inner.rules.values().filter(|r| r.enabled).count(),
            total_triggered: inner.total_triggered,
            total_resolved: inner.total_resolved,
        }
    }

    /// Runtime counters for health reporting.
    pub fn stats(&self) -> AlertStats {
        let inner = self.inner.lock().expect("alert state lock poisoned");
        AlertStats {
            checks_performed: inner.checks_performed,
            last_check: inner.last_check,
            total_triggered: inner.total_triggered,
            total_resolved: inner.total_resolved,
            active_count: inner.active.len(),
            history_len: inner.history.len(),
        }
    }
}

// ── Evaluation ───────────────────────────────────────────────────────

/// Scopes a rule applies to within one snapshot.
///
/// No scope fields → overall only. `service_name` only → that service's
/// entry. `endpoint` set → every endpoint entry whose path matches and
/// whose service matches when specified.
fn scope_targets<'a>(
    rule: &AlertRule,
    snapshot: &'a Snapshot,
) -> Vec<(&'a ScopeMetrics, Option<String>, Option<String>)> {
    match (&rule.service_name, &rule.endpoint) {
        (None, None) => vec![(&snapshot.overall, None, None)],
        (Some(service), None) => snapshot
            .services
            .get(service)
            .map(|metrics| (metrics, Some(service.clone()), None))
            .into_iter()
            .collect(),
        (service, Some(endpoint)) => snapshot
            .endpoints
            .iter()
            .filter(|(key, _)| {
                key.endpoint == *endpoint
                    && service.as_ref().map_or(true, |s| key.service == *s)
            })
            .map(|(key, metrics)| {
                (metrics, Some(key.service.clone()), Some(key.endpoint.clone()))
            })
            .collect(),
    }
}

fn evaluate_rules(inner: &mut Inner, snapshot: &Snapshot, now: DateTime<Utc>) -> Vec<Alert> {
    let rules: Vec<AlertRule> = inner.rules.values().filter(|r| r.enabled).cloned().collect();
    let mut transitions = Vec::new();

    for rule in rules {
        for (metrics, service_name, endpoint) in scope_targets(&rule, snapshot) {
            let value = rule.metric.read(metrics);
            let identity = AlertIdentity {
                rule_id: rule.id.clone(),
                service_name: service_name.clone(),
                endpoint: endpoint.clone(),
            };

            if rule.operator.holds(value, rule.threshold) {
                if !inner.active.contains_key(&identity) {
                    let alert = Alert::triggered(&rule, value, service_name, endpoint, now);
                    inner.history.push_back(alert.clone());
                    while inner.history.len() > MAX_HISTORY {
                        inner.history.pop_front();
                    }
                    inner.active.insert(identity, alert.clone());
                    inner.total_triggered += 1;
                    transitions.push(alert);
                }
            } else if let Some(mut alert) = inner.active.remove(&identity) {
                alert.status = AlertStatus::Resolved;
                alert.resolved_at = Some(now);
                inner.total_resolved += 1;
                transitions.push(alert);
            }
        }
    }

    transitions
}

/// The built-in rule set shipped with the pipeline.
fn default_rules(thresholds: &AlertThresholds, now: DateTime<Utc>) -> Vec<AlertRule> {
    let rule = |id: &str, name: &str, metric, operator, threshold, severity, duration| AlertRule {
        id: id.to_string(),
        name: name.to_string(),
        metric,
        operator,
        threshold,
        severity,
        service_name: None,
        endpoint: None,
        duration_seconds: duration,
        enabled: true,
        created_at: now,
    };

    vec![
        rule(
            "high_error_rate",
            "high error rate",
            RuleMetric::ErrorRate,
            RuleOperator::GreaterThan,
            thresholds.error_rate_high,
            AlertSeverity::High,
            60,
        ),
        rule(
            "critical_error_rate",
            "critical error rate",
            RuleMetric::ErrorRate,
            RuleOperator::GreaterThan,
            thresholds.error_rate_critical,
            AlertSeverity::Critical,
            30,
        ),
        rule(
            "high_p95_latency",
            "high p95 latency",
            RuleMetric::P95ResponseTime,
            RuleOperator::GreaterThan,
            thresholds.p95_latency_ms,
            AlertSeverity::Medium,
            120,
        ),
        rule(
            "critical_p99_latency",
            "critical p99 latency",
            RuleMetric::P99ResponseTime,
            RuleOperator::GreaterThan,
            thresholds.p99_latency_ms,
            AlertSeverity::Critical,
            60,
        ),
        rule(
            "low_qps",
            "low request rate",
            RuleMetric::Qps,
            RuleOperator::LessThan,
            thresholds.qps_low,
            AlertSeverity::Low,
            300,
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::collections::BTreeMap as Map;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use vigil_aggregator::EndpointKey;
    use vigil_core::ManualClock;

    use crate::sink::AlertError;

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
        ))
    }

    fn thresholds() -> AlertThresholds {
        AlertThresholds {
            error_rate_high: 5.0,
            error_rate_critical: 10.0,
            p95_latency_ms: 1000.0,
            p99_latency_ms: 5000.0,
            qps_low: 1.0,
        }
    }

    fn metrics(qps: f64, error_rate: f64, p95: f64, p99: f64) -> ScopeMetrics {
        ScopeMetrics {
            qps,
            error_rate,
            avg_response_time: p95 / 2.0,
            p95_response_time: p95,
            p99_response_time: p99,
            total_requests: 100,
            total_errors: (error_rate) as u64,
        }
    }

    fn snapshot_with(overall: ScopeMetrics) -> Snapshot {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 1, 0).unwrap();
        Snapshot {
            timestamp: now,
            window_start: now - chrono::Duration::seconds(60),
            window_end: now,
            window_size_seconds: 60,
            active_buckets: 12,
            overall,
            services: Map::new(),
            endpoints: Map::new(),
        }
    }

    /// Healthy overall metrics that trip no default rule.
    fn healthy() -> Snapshot {
        snapshot_with(metrics(10.0, 0.5, 100.0, 200.0))
    }

    struct CountingSink {
        notified: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl AlertSink for CountingSink {
        async fn notify(&self, _alert: &Alert) -> Result<(), AlertError> {
            self.notified.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(AlertError::Sink("mock failure".to_string()))
            } else {
                Ok(())
            }
        }

        fn name(&self) -> &str {
            "counting"
        }
    }

    #[tokio::test]
    async fn test_default_rules_present() {
        let manager = AlertManager::with_default_rules(clock(), &thresholds());
        let rules = manager.rules();
        assert_eq!(rules.len(), 5);
        assert!(rules.iter().any(|r| r.id == "high_error_rate"));
        assert!(rules.iter().any(|r| r.id == "low_qps"));
        assert!(rules.iter().all(|r| r.enabled));
    }

    #[tokio::test]
    async fn test_trigger_once_per_identity() {
        let manager = AlertManager::with_default_rules(clock(), &thresholds());
        let degraded = snapshot_with(metrics(10.0, 7.5, 100.0, 200.0));

        manager.check_snapshot(&degraded).await;
        manager.check_snapshot(&degraded).await;
        manager.check_snapshot(&degraded).await;

        let active = manager.active_alerts();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].rule_id, "high_error_rate");
        assert_eq!(active[0].status, AlertStatus::Triggered);
        assert_eq!(active[0].metric_value, 7.5);
        // Append-on-trigger history grows once.
        assert_eq!(manager.stats().history_len, 1);
        assert_eq!(manager.stats().total_triggered, 1);
    }

    #[tokio::test]
    async fn test_resolution() {
        let test_clock = clock();
        let manager = AlertManager::with_default_rules(test_clock.clone(), &thresholds());

        manager
            .check_snapshot(&snapshot_with(metrics(10.0, 7.5, 100.0, 200.0)))
            .await;
        assert_eq!(manager.active_alerts().len(), 1);
        let history_before = manager.stats().history_len;

        test_clock.advance_secs(10);
        manager
            .check_snapshot(&snapshot_with(metrics(10.0, 2.0, 100.0, 200.0)))
            .await;

        assert!(manager.active_alerts().is_empty());
        assert_eq!(manager.stats().total_resolved, 1);
        // History is append-on-trigger: resolution does not grow it.
        assert_eq!(manager.stats().history_len, history_before);

        let latest = &manager.history(1)[0];
        assert_eq!(latest.status, AlertStatus::Triggered);
    }

    #[tokio::test]
    async fn test_retrigger_creates_fresh_alert() {
        let test_clock = clock();
        let manager = AlertManager::with_default_rules(test_clock.clone(), &thresholds());
        let degraded = snapshot_with(metrics(10.0, 7.5, 100.0, 200.0));

        manager.check_snapshot(&degraded).await;
        let first_id = manager.active_alerts()[0].id.clone();

        test_clock.advance_secs(10);
        manager.check_snapshot(&healthy()).await;
        test_clock.advance_secs(10);
        manager.check_snapshot(&degraded).await;

        let second_id = manager.active_alerts()[0].id.clone();
        assert_ne!(first_id, second_id);
        assert_eq!(manager.stats().total_triggered, 2);
    }

    #[tokio::test]
    async fn test_disabled_rule_does_not_fire() {
        let manager = AlertManager::with_default_rules(clock(), &thresholds());
        assert!(manager.set_rule_enabled("high_error_rate", false));

        let degraded = snapshot_with(metrics(10.0, 7.5, 100.0, 200.0));
        manager.check_snapshot(&degraded).await;
        assert!(manager.active_alerts().is_empty());

        // Re-enabling fires exactly one alert on the next check.
        assert!(manager.set_rule_enabled("high_error_rate", true));
        manager.check_snapshot(&degraded).await;
        let active = manager.active_alerts();
        assert_eq!(active.len(), 1);
        assert!(active[0].service_name.is_none());
        assert!(active[0].endpoint.is_none());
    }

    #[tokio::test]
    async fn test_acknowledge_lifecycle() {
        let test_clock = clock();
        let manager = AlertManager::with_default_rules(test_clock.clone(), &thresholds());

        manager
            .check_snapshot(&snapshot_with(metrics(10.0, 7.5, 100.0, 200.0)))
            .await;
        let alert_id = manager.active_alerts()[0].id.clone();

        test_clock.advance_secs(5);
        assert!(manager.acknowledge(&alert_id));
        let acked = manager.active_alerts()[0].clone();
        assert_eq!(acked.status, AlertStatus::Acknowledged);
        assert!(acked.acknowledged_at.is_some());

        // Still resolves when the condition clears, timestamps ordered.
        test_clock.advance_secs(5);
        manager.check_snapshot(&healthy()).await;
        assert!(manager.active_alerts().is_empty());

        assert!(acked.triggered_at <= acked.acknowledged_at.unwrap());
    }

    #[tokio::test]
    async fn test_acknowledge_unknown_alert() {
        let manager = AlertManager::with_default_rules(clock(), &thresholds());
        assert!(!manager.acknowledge("no-such-alert"));
    }

    #[tokio::test]
    async fn test_unscoped_rule_ignores_service_scopes() {
        let manager = AlertManager::with_default_rules(clock(), &thresholds());

        // Overall is healthy but one service is degraded: unscoped rules
        // apply to the overall scope only, so nothing fires.
        let mut snapshot = healthy();
        snapshot
            .services
            .insert("model-a".to_string(), metrics(5.0, 50.0, 100.0, 200.0));
        manager.check_snapshot(&snapshot).await;
        assert!(manager.active_alerts().is_empty());
    }

    #[tokio::test]
    async fn test_service_scoped_rule() {
        let test_clock = clock();
        let manager = AlertManager::new(test_clock.clone());
        manager.upsert_rule(AlertRule {
            id: "model_a_errors".to_string(),
            name: "model-a error rate".to_string(),
            metric: RuleMetric::ErrorRate,
            operator: RuleOperator::GreaterThan,
            threshold: 5.0,
            severity: AlertSeverity::High,
            service_name: Some("model-a".to_string()),
            endpoint: None,
            duration_seconds: 60,
            enabled: true,
            created_at: test_clock.now(),
        });

        let mut snapshot = healthy();
        snapshot
            .services
            .insert("model-a".to_string(), metrics(5.0, 20.0, 100.0, 200.0));
        snapshot
            .services
            .insert("model-b".to_string(), metrics(5.0, 0.0, 100.0, 200.0));

        manager.check_snapshot(&snapshot).await;
        let active = manager.active_alerts();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].service_name.as_deref(), Some("model-a"));
    }

    #[tokio::test]
    async fn test_endpoint_scoped_rule_matches_across_services() {
        let test_clock = clock();
        let manager = AlertManager::new(test_clock.clone());
        manager.upsert_rule(AlertRule {
            id: "predict_latency".to_string(),
            name: "predict p95 latency".to_string(),
            metric: RuleMetric::P95ResponseTime,
            operator: RuleOperator::GreaterThan,
            threshold: 500.0,
            severity: AlertSeverity::Medium,
            service_name: None,
            endpoint: Some("/v1/predict".to_string()),
            duration_seconds: 60,
            enabled: true,
            created_at: test_clock.now(),
        });

        let mut snapshot = healthy();
        snapshot.endpoints.insert(
            EndpointKey::new("model-a", "/v1/predict"),
            metrics(5.0, 0.0, 900.0, 1000.0),
        );
        snapshot.endpoints.insert(
            EndpointKey::new("model-b", "/v1/predict"),
            metrics(5.0, 0.0, 100.0, 200.0),
        );
        snapshot.endpoints.insert(
            EndpointKey::new("model-a", "/v1/embed"),
            metrics(5.0, 0.0, 900.0, 1000.0),
        );

        manager.check_snapshot(&snapshot).await;
        let active = manager.active_alerts();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].service_name.as_deref(), Some("model-a"));
        assert_eq!(active[0].endpoint.as_deref(), Some("/v1/predict"));
    }

    #[tokio::test]
    async fn test_empty_snapshot_skips_evaluation() {
        let test_clock = clock();
        let manager = AlertManager::with_default_rules(test_clock.clone(), &thresholds());

        // Zeroed snapshot: qps 0 < 1 would otherwise page low_qps.
        let empty = Snapshot::empty(test_clock.now(), 60);
        manager.check_snapshot(&empty).await;

        assert!(manager.active_alerts().is_empty());
        assert_eq!(manager.stats().checks_performed, 1);
    }

    #[tokio::test]
    async fn test_sink_fanout_and_failure_isolation() {
        let mut manager = AlertManager::with_default_rules(clock(), &thresholds());
        let failing = Arc::new(CountingSink {
            notified: AtomicUsize::new(0),
            fail: true,
        });
        let ok = Arc::new(CountingSink {
            notified: AtomicUsize::new(0),
            fail: false,
        });
        manager.add_sink(failing.clone());
        manager.add_sink(ok.clone());

        manager
            .check_snapshot(&snapshot_with(metrics(10.0, 7.5, 100.0, 200.0)))
            .await;

        assert_eq!(failing.notified.load(Ordering::SeqCst), 1);
        assert_eq!(ok.notified.load(Ordering::SeqCst), 1);

        // Resolution notifies again.
        manager.check_snapshot(&healthy()).await;
        assert_eq!(ok.notified.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let test_clock = clock();
        let manager = AlertManager::with_default_rules(test_clock.clone(), &thresholds());
        let degraded = snapshot_with(metrics(10.0, 7.5, 100.0, 200.0));

        for _ in 0..(MAX_HISTORY + 50) {
            manager.check_snapshot(&degraded).await;
            test_clock.advance_secs(1);
            manager.check_snapshot(&healthy()).await;
            test_clock.advance_secs(1);
        }

        assert_eq!(manager.stats().history_len, MAX_HISTORY);
    }

    #[tokio::test]
    async fn test_summary_counts_by_severity() {
        let manager = AlertManager::with_default_rules(clock(), &thresholds());
        // Both error-rate rules fire: one high, one critical.
        manager
            .check_snapshot(&snapshot_with(metrics(10.0, 15.0, 100.0, 200.0)))
            .await;

        let summary = manager.summary();
        assert_eq!(summary.active_count, 2);
        assert_eq!(summary.active_by_severity["high"], 1);
        assert_eq!(summary.active_by_severity["critical"], 1);
        assert_eq!(summary.active_by_severity["low"], 0);
        assert_eq!(summary.total_rules, 5);
        assert_eq!(summary.enabled_rules, 5);
    }

    #[tokio::test]
    async fn test_rule_management() {
        let test_clock = clock();
        let manager = AlertManager::new(test_clock.clone());
        assert!(manager.rules().is_empty());

        manager.upsert_rule(AlertRule {
            id: "custom".to_string(),
            name: "custom".to_string(),
            metric: RuleMetric::Qps,
            operator: RuleOperator::LessThan,
            threshold: 0.5,
            severity: AlertSeverity::Low,
            service_name: None,
            endpoint: None,
            duration_seconds: 60,
            enabled: true,
            created_at: test_clock.now(),
        });
        assert_eq!(manager.rules().len(), 1);

        assert!(manager.remove_rule("custom"));
        assert!(!manager.remove_rule("custom"));
        assert!(manager.rules().is_empty());
    }
}
