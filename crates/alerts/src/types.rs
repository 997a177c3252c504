//! Alert rules and alert instances.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use vigil_aggregator::ScopeMetrics;

/// Tolerance for equality comparisons on metric values.
const EQ_EPSILON: f64 = 1e-3;

// ── Severity and status ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Low => "low",
            AlertSeverity::Medium => "medium",
            AlertSeverity::High => "high",
            AlertSeverity::Critical => "critical",
        }
    }
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Triggered,
    Acknowledged,
    Resolved,
}

// ── Rule predicate parts ─────────────────────────────────────────────

/// Which snapshot metric a rule inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleMetric {
    Qps,
    ErrorRate,
    AvgResponseTime,
    P95ResponseTime,
    P99ResponseTime,
}

impl RuleMetric {
    /// Read this metric out of one scope's metrics.
    pub fn read(&self, metrics: &ScopeMetrics) -> f64 {
        match self {
            RuleMetric::Qps => metrics.qps,
            RuleMetric::ErrorRate => metrics.error_rate,
            RuleMetric::AvgResponseTime => metrics.avg_response_time,
            RuleMetric::P95ResponseTime => metrics.p95_response_time,
            RuleMetric::P99ResponseTime => metrics.p99_response_time,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RuleMetric::Qps => "qps",
            RuleMetric::ErrorRate => "error_rate",
            RuleMetric::AvgResponseTime => "avg_response_time",
            RuleMetric::P95ResponseTime => "p95_response_time",
            RuleMetric::P99ResponseTime => "p99_response_time",
        }
    }
}

impl fmt::Display for RuleMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Comparison applied between the metric value and the rule threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleOperator {
    #[serde(rename = ">")]
    GreaterThan,
    #[serde(rename = "<")]
    LessThan,
    #[serde(rename = ">=")]
    GreaterOrEqual,
    #[serde(rename = "<=")]
    LessOrEqual,
    #[serde(rename = "==")]
    Equal,
}

impl RuleOperator {
    /// Whether `value OP threshold` holds.
    pub fn holds(&self, value: f64, threshold: f64) -> bool {
        match self {
            RuleOperator::GreaterThan => value > threshold,
            RuleOperator::LessThan => value < threshold,
            RuleOperator::GreaterOrEqual => value >= threshold,
            RuleOperator::LessOrEqual => value <= threshold,
            RuleOperator::Equal => (value - threshold).abs() < EQ_EPSILON,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RuleOperator::GreaterThan => ">",
            RuleOperator::LessThan => "<",
            RuleOperator::GreaterOrEqual => ">=",
            RuleOperator::LessOrEqual => "<=",
            RuleOperator::Equal => "==",
        }
    }
}

impl fmt::Display for RuleOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── AlertRule ────────────────────────────────────────────────────────

/// A threshold predicate on a metric at one scope.
///
/// A rule with neither `service_name` nor `endpoint` applies to the
/// overall scope only. With `service_name` set it applies to that
/// service; with `endpoint` set it applies to matching endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: String,
    pub name: String,
    pub metric: RuleMetric,
    pub operator: RuleOperator,
    pub threshold: f64,
    pub severity: AlertSeverity,
    #[serde(default)]
    pub service_name: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    /// How long the condition should hold before triggering. Carried for
    /// external tooling; evaluation triggers on the first satisfying check.
    #[serde(default = "default_duration")]
    pub duration_seconds: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

fn default_duration() -> u64 {
    60
}

fn default_enabled() -> bool {
    true
}

// ── Alert identity and instance ──────────────────────────────────────

/// Identity of an active alert: one rule applied at one scope.
///
/// At most one non-resolved alert exists per identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AlertIdentity {
    pub rule_id: String,
    pub service_name: Option<String>,
    pub endpoint: Option<String>,
}

impl fmt::Display for AlertIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.rule_id)?;
        if let Some(service) = &self.service_name {
            write!(f, ":{service}")?;
        }
        if let Some(endpoint) = &self.endpoint {
            write!(f, ":{endpoint}")?;
        }
        Ok(())
    }
}

/// One alert instance moving through
/// `triggered → (acknowledged →) resolved`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub rule_id: String,
    pub rule_name: String,
    pub severity: AlertSeverity,
    pub status: AlertStatus,
    pub message: String,
    pub metric_value: f64,
    pub threshold: f64,
    pub service_name: Option<String>,
    pub endpoint: Option<String>,
    pub triggered_at: DateTime<Utc>,
    #[serde(default)]
    pub acknowledged_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Alert {
    /// Build a freshly-triggered alert for a rule at one scope.
    pub fn triggered(
        rule: &AlertRule,
        metric_value: f64,
        service_name: Option<String>,
        endpoint: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let message = build_message(rule, metric_value, service_name.as_deref(), endpoint.as_deref());
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            rule_id: rule.id.clone(),
            rule_name: rule.name.clone(),
            severity: rule.severity,
            status: AlertStatus::Triggered,
            message,
            metric_value,
            threshold: rule.threshold,
            service_name,
            endpoint,
            triggered_at: now,
            acknowledged_at: None,
            resolved_at: None,
        }
    }

    /// The identity this alert occupies in the active map.
    pub fn identity(&self) -> AlertIdentity {
        AlertIdentity {
            rule_id: self.rule_id.clone(),
            service_name: self.service_name.clone(),
            endpoint: self.endpoint.clone(),
        }
    }
}

fn build_message(
    rule: &AlertRule,
    metric_value: f64,
    service_name: Option<&str>,
    endpoint: Option<&str>,
) -> String {
    let scope = match (service_name, endpoint) {
        (Some(service), Some(endpoint)) => format!("service {service} endpoint {endpoint}"),
        (Some(service), None) => format!("service {service}"),
        _ => "overall".to_string(),
    };
    format!(
        "{scope} {}: {} = {metric_value:.2} {} {} (severity: {})",
        rule.name, rule.metric, rule.operator, rule.threshold, rule.severity
    )
}
