//! Alert notification sinks.
//!
//! Sinks receive every alert transition (trigger and resolve). Individual
//! sink failures are logged by the manager and never block other sinks.

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

use crate::types::{Alert, AlertStatus};

#[derive(Debug, Error)]
pub enum AlertError {
    #[error("sink delivery failed: {0}")]
    Sink(String),
}

/// A notification channel for alert transitions.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn notify(&self, alert: &Alert) -> Result<(), AlertError>;

    /// Human-readable name for logging.
    fn name(&self) -> &str;
}

/// Sink that writes alert transitions to the log.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl AlertSink for LogSink {
    async fn notify(&self, alert: &Alert) -> Result<(), AlertError> {
        match alert.status {
            AlertStatus::Resolved => {
                info!(
                    alert_id = %alert.id,
                    rule_id = %alert.rule_id,
                    "alert resolved: {}",
                    alert.message
                );
            }
            _ => {
                warn!(
                    alert_id = %alert.id,
                    rule_id = %alert.rule_id,
                    severity = %alert.severity,
                    "alert triggered: {}",
                    alert.message
                );
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }
}
