//! Pipeline orchestrator.
//!
//! Wires the consumer, aggregator, storage, and alert manager together and
//! drives the periodic storage, alert-check, and health schedules. Each
//! schedule is an independent long-lived task; a failed tick is logged and
//! skipped, never fatal to the loop or its siblings.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use vigil_aggregator::{SlidingWindow, Snapshot};
use vigil_alerts::{AlertManager, LogSink};
use vigil_core::{Clock, Config};
use vigil_queue::{AlertPublisher, MetricsConsumer};
use vigil_storage::{MetricsCache, StorageManager};

use crate::handler::{AggregatorHandler, SharedAggregator};
use crate::health::HealthReport;
use crate::sinks::BrokerAlertSink;

/// Interval between health checks.
const HEALTH_INTERVAL: Duration = Duration::from_secs(30);

/// Persist only when the window saw traffic.
fn should_persist(snapshot: &Snapshot) -> bool {
    snapshot.overall.total_requests > 0
}

/// Take a snapshot and persist it if non-empty. Returns whether a store
/// was issued.
async fn run_storage_tick(
    aggregator: &SharedAggregator,
    storage: &StorageManager,
    clock: &dyn Clock,
) -> bool {
    let snapshot = {
        let window = aggregator.read().expect("aggregator lock poisoned");
        window.snapshot(clock.now())
    };

    if !should_persist(&snapshot) {
        debug!("window empty, skipping persistence");
        storage.cache_snapshot(&snapshot).await;
        return false;
    }

    storage.store_metrics(&snapshot).await;
    true
}

/// Take a snapshot and run rule evaluation over it.
async fn run_alert_tick(
    aggregator: &SharedAggregator,
    alerts: &AlertManager,
    clock: &dyn Clock,
) {
    let snapshot = {
        let window = aggregator.read().expect("aggregator lock poisoned");
        window.snapshot(clock.now())
    };
    alerts.check_snapshot(&snapshot).await;
}

/// Processor-level counters.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProcessorStats {
    pub running: bool,
    pub storage_ticks: u64,
    pub alert_ticks: u64,
}

/// Owns the lifecycle of the pipeline components.
pub struct Processor {
    config: Config,
    clock: Arc<dyn Clock>,
    aggregator: SharedAggregator,
    alerts: Arc<AlertManager>,
    storage: Arc<StorageManager>,
    consumer: Arc<MetricsConsumer>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    storage_ticks: Arc<AtomicU64>,
    alert_ticks: Arc<AtomicU64>,
    running: bool,
}

impl Processor {
    /// Build all components and connect external resources.
    ///
    /// Postgres is required; Redis and the alerts queue are optional and
    /// only degrade the pipeline when absent.
    pub async fn initialize(config: Config, clock: Arc<dyn Clock>) -> anyhow::Result<Self> {
        config.validate().context("invalid configuration")?;

        let aggregator: SharedAggregator = Arc::new(RwLock::new(SlidingWindow::new(
            config.window.window_size_seconds,
            config.window.sub_window_seconds,
        )));

        let mut alerts = AlertManager::with_default_rules(clock.clone(), &config.thresholds);
        alerts.add_sink(Arc::new(LogSink));
        match AlertPublisher::connect(&config.broker.url, &config.broker.alerts_queue).await {
            Ok(publisher) => {
                alerts.add_sink(Arc::new(BrokerAlertSink::new(publisher)));
            }
            Err(e) => {
                warn!(error = %e, "alerts queue unavailable, broker notifications disabled");
            }
        }

        let storage = StorageManager::connect(&config.postgres, &config.storage)
            .await
            .context("time-series store connection failed")?;
        let storage = match MetricsCache::connect(&config.redis.url, config.redis.ttl_seconds).await
        {
            Ok(cache) => storage.with_cache(cache),
            Err(e) => {
                warn!(error = %e, "cache unavailable, running without snapshot mirror");
                storage
            }
        };

        let handler = Arc::new(AggregatorHandler::new(aggregator.clone()));
        let consumer = Arc::new(MetricsConsumer::new(
            config.broker.url.clone(),
            config.broker.metrics_queue.clone(),
            config.broker.prefetch_count,
            handler,
        ));

        let (shutdown, _) = watch::channel(false);

        info!("processor initialized");
        Ok(Self {
            config,
            clock,
            aggregator,
            alerts: Arc::new(alerts),
            storage: Arc::new(storage),
            consumer,
            shutdown,
            tasks: Vec::new(),
            storage_ticks: Arc::new(AtomicU64::new(0)),
            alert_ticks: Arc::new(AtomicU64::new(0)),
            running: false,
        })
    }

    /// Begin consumption and launch the periodic schedules.
    pub fn start(&mut self) {
        if self.running {
            warn!("processor already running");
            return;
        }

        // Consumer delivery loop.
        let consumer = self.consumer.clone();
        let rx = self.shutdown.subscribe();
        self.tasks.push((
            "consumer",
            tokio::spawn(async move {
                if let Err(e) = consumer.run(rx).await {
                    warn!(error = %e, "consumer loop exited with error");
                }
            }),
        ));

        // Storage tick.
        let aggregator = self.aggregator.clone();
        let storage = self.storage.clone();
        let clock = self.clock.clone();
        let ticks = self.storage_ticks.clone();
        let mut rx = self.shutdown.subscribe();
        let interval = Duration::from_secs(self.config.processor.storage_interval_seconds);
        self.tasks.push((
            "storage",
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if run_storage_tick(&aggregator, &storage, &*clock).await {
                                ticks.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                        _ = rx.changed() => {
                            if *rx.borrow() {
                                break;
                            }
                        }
                    }
                }
            }),
        ));

        // Alert tick.
        let aggregator = self.aggregator.clone();
        let alerts = self.alerts.clone();
        let clock = self.clock.clone();
        let ticks = self.alert_ticks.clone();
        let mut rx = self.shutdown.subscribe();
        let interval = Duration::from_secs(self.config.processor.alert_check_interval_seconds);
        self.tasks.push((
            "alerts",
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            run_alert_tick(&aggregator, &alerts, &*clock).await;
                            ticks.fetch_add(1, Ordering::Relaxed);
                        }
                        _ = rx.changed() => {
                            if *rx.borrow() {
                                break;
                            }
                        }
                    }
                }
            }),
        ));

        // Health tick.
        let consumer = self.consumer.clone();
        let aggregator = self.aggregator.clone();
        let storage = self.storage.clone();
        let alerts = self.alerts.clone();
        let clock = self.clock.clone();
        let mut rx = self.shutdown.subscribe();
        self.tasks.push((
            "health",
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(HEALTH_INTERVAL);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let aggregator_stats = {
                                let window =
                                    aggregator.read().expect("aggregator lock poisoned");
                                window.stats()
                            };
                            let report = HealthReport::build(
                                &consumer.stats(),
                                &aggregator_stats,
                                Some(&storage.stats()),
                                &alerts.stats(),
                                clock.now(),
                            );
                            if report.overall_healthy {
                                debug!("health check passed");
                            } else {
                                let failing: Vec<&str> = report
                                    .components
                                    .iter()
                                    .filter(|(_, c)| !c.healthy)
                                    .map(|(name, _)| name.as_str())
                                    .collect();
                                warn!(components = ?failing, "health check failed");
                            }
                        }
                        _ = rx.changed() => {
                            if *rx.borrow() {
                                break;
                            }
                        }
                    }
                }
            }),
        ));

        self.running = true;
        info!(
            storage_interval = self.config.processor.storage_interval_seconds,
            alert_interval = self.config.processor.alert_check_interval_seconds,
            "processor started"
        );
    }

    /// Stop consumption, join the schedules within the shutdown budget,
    /// flush pending rows, and tear down connections.
    pub async fn stop(&mut self) {
        if !self.running {
            return;
        }
        info!("stopping processor");

        self.shutdown.send(true).ok();

        let budget = Duration::from_secs(self.config.processor.shutdown_timeout_seconds);
        for (name, handle) in self.tasks.drain(..) {
            let abort = handle.abort_handle();
            match tokio::time::timeout(budget, handle).await {
                Ok(Ok(())) => debug!(task = name, "task stopped"),
                Ok(Err(e)) => warn!(task = name, error = %e, "task ended abnormally"),
                Err(_) => {
                    abort.abort();
                    warn!(task = name, "task did not stop in time, aborted");
                }
            }
        }

        self.storage.force_flush().await;
        self.storage.close().await;

        self.running = false;
        info!("processor stopped");
    }

    /// Current aggregated metrics.
    pub fn current_snapshot(&self) -> Snapshot {
        let window = self.aggregator.read().expect("aggregator lock poisoned");
        window.snapshot(self.clock.now())
    }

    /// Current per-component health.
    pub fn health_report(&self) -> HealthReport {
        let aggregator_stats = {
            let window = self.aggregator.read().expect("aggregator lock poisoned");
            window.stats()
        };
        HealthReport::build(
            &self.consumer.stats(),
            &aggregator_stats,
            Some(&self.storage.stats()),
            &self.alerts.stats(),
            self.clock.now(),
        )
    }

    /// The alert manager, for rule management and acknowledgements.
    pub fn alerts(&self) -> &Arc<AlertManager> {
        &self.alerts
    }

    /// Processor-level counters.
    pub fn stats(&self) -> ProcessorStats {
        ProcessorStats {
            running: self.running,
            storage_ticks: self.storage_ticks.load(Ordering::Relaxed),
            alert_ticks: self.alert_ticks.load(Ordering::Relaxed),
        }
    }

    /// Delete persisted rows past the configured retention.
    pub async fn cleanup_old_data(&self) -> anyhow::Result<u64> {
        let deleted = self
            .storage
            .cleanup_old_data(self.config.storage.retention_days)
            .await
            .context("retention cleanup failed")?;
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use vigil_core::config::AlertThresholds;
    use vigil_core::{EventType, ManualClock, MetricsEvent};

    fn event(offset_secs: i64, status: u16) -> MetricsEvent {
        MetricsEvent {
            event_id: format!("evt-{offset_secs}-{status}"),
            event_type: EventType::ApiResponse,
            timestamp: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
                + chrono::Duration::seconds(offset_secs),
            service_name: "model-a".to_string(),
            endpoint: "/v1/predict".to_string(),
            http_method: "POST".to_string(),
            status_code: status,
            response_time_ms: Some(30.0),
            request_size_bytes: None,
            response_size_bytes: None,
            client_ip: None,
            user_agent: None,
            trace_id: None,
            error_message: None,
            error_type: None,
            metadata: Default::default(),
        }
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

    #[test]
    fn test_should_persist_gates_on_traffic() {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 1, 0).unwrap();
        assert!(!should_persist(&Snapshot::empty(now, 60)));

        let mut window = SlidingWindow::new(60, 5);
        window.add_event(&event(0, 200));
        assert!(should_persist(&window.snapshot(now)));
    }

    #[tokio::test]
    async fn test_alert_tick_evaluates_current_window() {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 1, 0).unwrap(),
        ));
        let aggregator: SharedAggregator = Arc::new(RwLock::new(SlidingWindow::new(60, 5)));
        let alerts = AlertManager::with_default_rules(clock.clone(), &thresholds());

        // 20% errors with plenty of traffic: both error-rate rules fire.
        {
            let mut window = aggregator.write().unwrap();
            for i in 0..80 {
                window.add_event(&event(i % 50, 200));
            }
            for i in 0..20 {
                window.add_event(&event(i % 50, 500));
            }
        }

        run_alert_tick(&aggregator, &alerts, &*clock).await;

        let active = alerts.active_alerts();
        assert_eq!(active.len(), 2);
        assert!(active.iter().any(|a| a.rule_id == "high_error_rate"));
        assert!(active.iter().any(|a| a.rule_id == "critical_error_rate"));
    }

    #[tokio::test]
    async fn test_alert_tick_on_quiet_window_fires_nothing() {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 1, 0).unwrap(),
        ));
        let aggregator: SharedAggregator = Arc::new(RwLock::new(SlidingWindow::new(60, 5)));
        let alerts = AlertManager::with_default_rules(clock.clone(), &thresholds());

        run_alert_tick(&aggregator, &alerts, &*clock).await;
        assert!(alerts.active_alerts().is_empty());
    }
}
