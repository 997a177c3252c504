//! Alert-notification publisher.
//!
//! Publishes alert payloads to the durable alerts queue so external
//! consumers (pagers, chat bridges) can pick them up. Optional: the
//! pipeline runs fine without it.

use lapin::options::{BasicPublishOptions, QueueDeclareOptions};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tracing::{debug, info};

use crate::error::QueueError;

/// Per-message TTL on the alerts queue (7 days).
const ALERT_TTL_MS: i64 = 604_800_000;

/// Maximum queued alert notifications.
const ALERT_MAX_LENGTH: i64 = 10_000;

/// Publishes JSON payloads to the alerts queue.
pub struct AlertPublisher {
    // Held so the channel's connection outlives the publisher.
    _connection: Connection,
    channel: Channel,
    queue_name: String,
}

impl AlertPublisher {
    /// Connect and declare the durable alerts queue.
    pub async fn connect(url: &str, queue_name: &str) -> Result<Self, QueueError> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| QueueError::Connection(format!("broker connect failed: {e}")))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| QueueError::Connection(format!("channel open failed: {e}")))?;

        let mut args = FieldTable::default();
        args.insert("x-message-ttl".into(), AMQPValue::LongLongInt(ALERT_TTL_MS));
        args.insert("x-max-length".into(), AMQPValue::LongLongInt(ALERT_MAX_LENGTH));

        channel
            .queue_declare(
                queue_name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                args,
            )
            .await
            .map_err(|e| QueueError::Connection(format!("queue declare failed: {e}")))?;

        info!(queue = %queue_name, "alert publisher connected");

        Ok(Self {
            _connection: connection,
            channel,
            queue_name: queue_name.to_string(),
        })
    }

    /// Publish one JSON payload as a persistent message.
    pub async fn publish_json(&self, payload: &serde_json::Value) -> Result<(), QueueError> {
        let body = serde_json::to_vec(payload)
            .map_err(|e| QueueError::Publish(format!("serialize failed: {e}")))?;

        self.channel
            .basic_publish(
                "",
                &self.queue_name,
                BasicPublishOptions::default(),
                &body,
                BasicProperties::default().with_delivery_mode(2),
            )
            .await
            .map_err(|e| QueueError::Publish(format!("publish failed: {e}")))?
            .await
            .map_err(|e| QueueError::Publish(format!("publish confirm failed: {e}")))?;

        debug!(queue = %self.queue_name, "alert notification published");
        Ok(())
    }
}
