//! RabbitMQ metrics-event consumer.
//!
//! Maintains a durable subscription to the metrics queue: declares it with
//! its retention properties, applies the prefetch QoS, decodes each
//! delivery, and hands decoded events to the registered [`EventHandler`].
//! Every delivery is acknowledged exactly once — bad messages and handler
//! failures are counted and dropped, never requeued.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::StreamExt;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicQosOptions, QueueDeclareOptions};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{Channel, Connection, ConnectionProperties};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::QueueError;
use crate::handler::{decode_event, EventHandler};

// ── Queue properties ─────────────────────────────────────────────────

/// Per-message TTL on the metrics queue (24 h).
const MESSAGE_TTL_MS: i64 = 86_400_000;

/// Maximum queued messages before the broker drops the oldest.
const MAX_QUEUE_LENGTH: i64 = 100_000;

/// First reconnect delay after a connection loss.
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Reconnect delay cap.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Double the backoff, capped.
fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(MAX_BACKOFF)
}

// ── Consumer state ───────────────────────────────────────────────────

/// Connection lifecycle of the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerState {
    Disconnected,
    Connecting,
    Connected,
    Consuming,
    Closed,
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConsumerState::Disconnected => "disconnected",
            ConsumerState::Connecting => "connecting",
            ConsumerState::Connected => "connected",
            ConsumerState::Consuming => "consuming",
            ConsumerState::Closed => "closed",
        };
        f.write_str(name)
    }
}

// ── Stats ────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct StatsInner {
    total_consumed: AtomicU64,
    successful_processed: AtomicU64,
    failed_processed: AtomicU64,
    invalid_messages: AtomicU64,
}

/// Point-in-time consumer statistics.
#[derive(Debug, Clone, Serialize)]
pub struct ConsumerStats {
    pub queue_name: String,
    pub state: ConsumerState,
    pub total_consumed: u64,
    pub successful_processed: u64,
    pub failed_processed: u64,
    pub invalid_messages: u64,
    pub messages_per_second: f64,
    pub success_rate: f64,
    pub uptime_seconds: f64,
}

// ── MetricsConsumer ──────────────────────────────────────────────────

/// Durable, automatically-reconnecting consumer for the metrics queue.
pub struct MetricsConsumer {
    url: String,
    queue_name: String,
    prefetch_count: u16,
    handler: Arc<dyn EventHandler>,
    state: Mutex<ConsumerState>,
    stats: StatsInner,
    started_at: Mutex<Option<Instant>>,
}

impl MetricsConsumer {
    pub fn new(
        url: impl Into<String>,
        queue_name: impl Into<String>,
        prefetch_count: u16,
        handler: Arc<dyn EventHandler>,
    ) -> Self {
        Self {
            url: url.into(),
            queue_name: queue_name.into(),
            prefetch_count,
            handler,
            state: Mutex::new(ConsumerState::Disconnected),
            stats: StatsInner::default(),
            started_at: Mutex::new(None),
        }
    }

    fn set_state(&self, state: ConsumerState) {
        *self.state.lock().expect("state lock poisoned") = state;
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConsumerState {
        *self.state.lock().expect("state lock poisoned")
    }

    /// Consume until `shutdown` flips to `true`, reconnecting with
    /// exponential backoff on connection loss.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), QueueError> {
        {
            let mut started = self.started_at.lock().expect("started lock poisoned");
            started.get_or_insert_with(Instant::now);
        }

        let mut backoff = INITIAL_BACKOFF;
        loop {
            if *shutdown.borrow() {
                break;
            }

            self.set_state(ConsumerState::Connecting);
            match self.consume_session(&mut shutdown).await {
                Ok(()) => break, // shutdown requested
                Err(e) => {
                    // Backoff grows only across consecutive connect failures.
                    if self.state() == ConsumerState::Consuming {
                        backoff = INITIAL_BACKOFF;
                    }
                    self.set_state(ConsumerState::Disconnected);
                    warn!(
                        queue = %self.queue_name,
                        error = %e,
                        retry_in = ?backoff,
                        "broker connection lost, reconnecting"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = shutdown.changed() => {}
                    }
                    backoff = next_backoff(backoff);
                }
            }
        }

        self.set_state(ConsumerState::Closed);
        info!(queue = %self.queue_name, "consumer closed");
        Ok(())
    }

    /// One connect-and-consume session. Returns `Ok` only on shutdown.
    async fn consume_session(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), QueueError> {
        // The connection handle must outlive the channel's delivery stream.
        let (_connection, channel) = self.connect().await?;
        self.set_state(ConsumerState::Connected);

        let mut consumer = channel
            .basic_consume(
                &self.queue_name,
                "vigil-metrics-consumer",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| QueueError::Connection(format!("basic_consume failed: {e}")))?;

        self.set_state(ConsumerState::Consuming);
        info!(queue = %self.queue_name, prefetch = self.prefetch_count, "consuming events");

        loop {
            tokio::select! {
                delivery = consumer.next() => {
                    match delivery {
                        Some(Ok(delivery)) => self.process_delivery(delivery).await?,
                        Some(Err(e)) => {
                            return Err(QueueError::Connection(format!("delivery error: {e}")));
                        }
                        None => {
                            return Err(QueueError::Connection(
                                "delivery stream ended".to_string(),
                            ));
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Establish the connection, apply QoS, and declare the durable queue.
    async fn connect(&self) -> Result<(Connection, Channel), QueueError> {
        let connection = Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .map_err(|e| QueueError::Connection(format!("broker connect failed: {e}")))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| QueueError::Connection(format!("channel open failed: {e}")))?;

        channel
            .basic_qos(self.prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| QueueError::Connection(format!("basic_qos failed: {e}")))?;

        let mut args = FieldTable::default();
        args.insert("x-message-ttl".into(), AMQPValue::LongLongInt(MESSAGE_TTL_MS));
        args.insert("x-max-length".into(), AMQPValue::LongLongInt(MAX_QUEUE_LENGTH));

        channel
            .queue_declare(
                &self.queue_name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                args,
            )
            .await
            .map_err(|e| QueueError::Connection(format!("queue declare failed: {e}")))?;

        info!(queue = %self.queue_name, "broker connection established");
        Ok((connection, channel))
    }

    /// Decode and dispatch one delivery, then acknowledge it.
    ///
    /// Failures are counted and the message is still acked — a poison
    /// message must never loop back through the queue.
    async fn process_delivery(&self, delivery: lapin::message::Delivery) -> Result<(), QueueError> {
        self.stats.total_consumed.fetch_add(1, Ordering::Relaxed);

        match decode_event(&delivery.data) {
            Ok(event) => {
                let event_id = event.event_id.clone();
                match self.handler.handle(event).await {
                    Ok(()) => {
                        self.stats.successful_processed.fetch_add(1, Ordering::Relaxed);
                        debug!(event_id = %event_id, "event processed");
                    }
                    Err(e) => {
                        self.stats.failed_processed.fetch_add(1, Ordering::Relaxed);
                        warn!(event_id = %event_id, error = %e, "event handler failed");
                    }
                }
            }
            Err(e) => {
                self.stats.invalid_messages.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "invalid message body, dropping");
            }
        }

        delivery
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| QueueError::Ack(format!("ack failed: {e}")))
    }

    /// Point-in-time statistics.
    pub fn stats(&self) -> ConsumerStats {
        let total = self.stats.total_consumed.load(Ordering::Relaxed);
        let successful = self.stats.successful_processed.load(Ordering::Relaxed);
        let uptime = self
            .started_at
            .lock()
            .expect("started lock poisoned")
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0);

        ConsumerStats {
            queue_name: self.queue_name.clone(),
            state: self.state(),
            total_consumed: total,
            successful_processed: successful,
            failed_processed: self.stats.failed_processed.load(Ordering::Relaxed),
            invalid_messages: self.stats.invalid_messages.load(Ordering::Relaxed),
            messages_per_second: if uptime > 0.0 { total as f64 / uptime } else { 0.0 },
            success_rate: if total > 0 {
                successful as f64 / total as f64 * 100.0
            } else {
                0.0
            },
            uptime_seconds: uptime,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use vigil_core::MetricsEvent;

    struct NoopHandler;

    #[async_trait]
    impl EventHandler for NoopHandler {
        async fn handle(&self, _event: MetricsEvent) -> Result<(), QueueError> {
            Ok(())
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = INITIAL_BACKOFF;
        backoff = next_backoff(backoff);
        assert_eq!(backoff, Duration::from_secs(2));
        backoff = next_backoff(backoff);
        assert_eq!(backoff, Duration::from_secs(4));

        for _ in 0..10 {
            backoff = next_backoff(backoff);
        }
        assert_eq!(backoff, MAX_BACKOFF);
    }

    #[test]
    fn test_initial_state_is_disconnected() {
        let consumer = MetricsConsumer::new(
            "amqp://localhost",
            "metrics.api_requests",
            1000,
            Arc::new(NoopHandler),
        );
        assert_eq!(consumer.state(), ConsumerState::Disconnected);
    }

    #[test]
    fn test_stats_before_start() {
        let consumer = MetricsConsumer::new(
            "amqp://localhost",
            "metrics.api_requests",
            1000,
            Arc::new(NoopHandler),
        );
        let stats = consumer.stats();
        assert_eq!(stats.total_consumed, 0);
        assert_eq!(stats.messages_per_second, 0.0);
        assert_eq!(stats.success_rate, 0.0);
        assert_eq!(stats.uptime_seconds, 0.0);
        assert_eq!(stats.queue_name, "metrics.api_requests");
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConsumerState::Consuming.to_string(), "consuming");
        assert_eq!(ConsumerState::Disconnected.to_string(), "disconnected");
    }

    #[tokio::test]
    async fn test_run_exits_on_shutdown() {
        let consumer = Arc::new(MetricsConsumer::new(
            // Unroutable address: the consumer stays in its reconnect loop
            // until shutdown flips.
            "amqp://127.0.0.1:1",
            "metrics.api_requests",
            10,
            Arc::new(NoopHandler),
        ));

        let (tx, rx) = watch::channel(false);
        let runner = consumer.clone();
        let handle = tokio::spawn(async move { runner.run(rx).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("run should exit after shutdown")
            .expect("task should not panic");
        assert!(result.is_ok());
        assert_eq!(consumer.state(), ConsumerState::Closed);
    }
}
