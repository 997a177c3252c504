//! Redis mirror of the newest snapshot.
//!
//! Every scope of the most recent snapshot is written under a `:current`
//! key with a short TTL so the read side can serve dashboards without
//! touching Postgres.

use redis::aio::ConnectionManager;
use tracing::{debug, info};

use vigil_aggregator::{EndpointKey, Snapshot};

use crate::error::StorageError;

/// Cache key for the overall scope.
pub fn overall_key() -> &'static str {
    "metrics:overall:current"
}

/// Cache key for one service scope.
pub fn service_key(service: &str) -> String {
    format!("metrics:service:{service}:current")
}

/// Cache key for one endpoint scope.
pub fn endpoint_key(key: &EndpointKey) -> String {
    format!("metrics:endpoint:{key}:current")
}

/// Cache key for the whole snapshot.
pub fn snapshot_key() -> &'static str {
    "metrics:snapshot:current"
}

/// Redis-backed snapshot cache.
#[derive(Clone)]
pub struct MetricsCache {
    conn: ConnectionManager,
    ttl_seconds: u64,
}

impl MetricsCache {
    /// Connect to Redis; the connection manager reconnects on its own.
    pub async fn connect(url: &str, ttl_seconds: u64) -> Result<Self, StorageError> {
        let client = redis::Client::open(url).map_err(StorageError::Cache)?;
        let conn = ConnectionManager::new(client).await?;
        info!(ttl_seconds, "redis cache connected");
        Ok(Self { conn, ttl_seconds })
    }

    /// Mirror a snapshot under all of its `:current` keys in one pipeline.
    pub async fn store_snapshot(&self, snapshot: &Snapshot) -> Result<(), StorageError> {
        let mut pipe = redis::pipe();

        pipe.set_ex(
            overall_key(),
            serde_json::to_string(&snapshot.overall)?,
            self.ttl_seconds,
        );
        for (service, metrics) in &snapshot.services {
            pipe.set_ex(
                service_key(service),
                serde_json::to_string(metrics)?,
                self.ttl_seconds,
            );
        }
        for (key, metrics) in &snapshot.endpoints {
            pipe.set_ex(
                endpoint_key(key),
                serde_json::to_string(metrics)?,
                self.ttl_seconds,
            );
        }
        pipe.set_ex(
            snapshot_key(),
            serde_json::to_string(snapshot)?,
            self.ttl_seconds,
        );

        let mut conn = self.conn.clone();
        pipe.query_async::<()>(&mut conn).await?;

        debug!(
            services = snapshot.services.len(),
            endpoints = snapshot.endpoints.len(),
            "snapshot cached"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_keys() {
        assert_eq!(overall_key(), "metrics:overall:current");
        assert_eq!(service_key("model-a"), "metrics:service:model-a:current");
        assert_eq!(
            endpoint_key(&EndpointKey::new("model-a", "/v1/predict")),
            "metrics:endpoint:model-a:/v1/predict:current"
        );
        assert_eq!(snapshot_key(), "metrics:snapshot:current");
    }
}
