pub mod manager;
pub mod sink;
pub mod types;

pub use manager::{AlertManager, AlertStats, AlertSummary};
pub use sink::{AlertError, AlertSink, LogSink};
pub use types::{
    Alert, AlertIdentity, AlertRule, AlertSeverity, AlertStatus, RuleMetric, RuleOperator,
};
