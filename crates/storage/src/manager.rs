//! Durable persistence of snapshot rows.
//!
//! Rows accumulate in a batcher and are written with one multi-row insert
//! per flush. The cache mirror is updated on every call regardless of
//! batching state; cache failures never block persistence and vice versa.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::{info, warn};

use vigil_aggregator::Snapshot;
use vigil_core::config::{PostgresConfig, StorageConfig};

use crate::batcher::MetricsBatcher;
use crate::cache::MetricsCache;
use crate::error::StorageError;
use crate::rows::{flatten_snapshot, MetricRow};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS metrics_aggregated (
    id BIGSERIAL PRIMARY KEY,
    timestamp TIMESTAMPTZ NOT NULL,
    window_start TIMESTAMPTZ NOT NULL,
    window_end TIMESTAMPTZ NOT NULL,
    service_name VARCHAR(255),
    endpoint VARCHAR(255),
    metric_type VARCHAR(50) NOT NULL,
    qps DOUBLE PRECISION DEFAULT 0,
    error_rate DOUBLE PRECISION DEFAULT 0,
    avg_response_time DOUBLE PRECISION DEFAULT 0,
    p95_response_time DOUBLE PRECISION DEFAULT 0,
    p99_response_time DOUBLE PRECISION DEFAULT 0,
    total_requests BIGINT DEFAULT 0,
    total_errors BIGINT DEFAULT 0,
    additional_data JSONB,
    created_at TIMESTAMPTZ DEFAULT NOW()
);

CREATE INDEX IF NOT EXISTS idx_metrics_timestamp ON metrics_aggregated(timestamp);
CREATE INDEX IF NOT EXISTS idx_metrics_service ON metrics_aggregated(service_name);
CREATE INDEX IF NOT EXISTS idx_metrics_endpoint ON metrics_aggregated(endpoint);
CREATE INDEX IF NOT EXISTS idx_metrics_type ON metrics_aggregated(metric_type);
CREATE INDEX IF NOT EXISTS idx_metrics_window_start ON metrics_aggregated(window_start);
"#;

/// Point-in-time storage statistics.
#[derive(Debug, Clone, Serialize)]
pub struct StorageStats {
    pub rows_written: u64,
    pub batch_writes: u64,
    pub failed_writes: u64,
    pub cache_writes: u64,
    pub pending_rows: usize,
    pub cache_configured: bool,
    /// Whether the most recent batch write reached the store.
    pub last_write_ok: bool,
}

/// Persists snapshots to Postgres and mirrors the newest one to Redis.
pub struct StorageManager {
    pool: PgPool,
    cache: Option<MetricsCache>,
    batcher: Mutex<MetricsBatcher>,
    rows_written: AtomicU64,
    batch_writes: AtomicU64,
    failed_writes: AtomicU64,
    cache_writes: AtomicU64,
    last_write_ok: AtomicBool,
}

impl StorageManager {
    /// Connect to Postgres and ensure the table and indexes exist.
    pub async fn connect(
        postgres: &PostgresConfig,
        storage: &StorageConfig,
    ) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(postgres.max_connections)
            .connect(&postgres.connection_string())
            .await?;

        sqlx::raw_sql(SCHEMA_SQL).execute(&pool).await?;
        info!(
            host = %postgres.host,
            database = %postgres.database,
            "time-series store ready"
        );

        Ok(Self {
            pool,
            cache: None,
            batcher: Mutex::new(MetricsBatcher::new(
                storage.batch_size,
                Duration::from_secs(storage.batch_timeout_seconds),
            )),
            rows_written: AtomicU64::new(0),
            batch_writes: AtomicU64::new(0),
            failed_writes: AtomicU64::new(0),
            cache_writes: AtomicU64::new(0),
            last_write_ok: AtomicBool::new(true),
        })
    }

    /// Attach the Redis snapshot mirror.
    pub fn with_cache(mut self, cache: MetricsCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Mirror a snapshot to the cache without buffering any rows.
    ///
    /// Used for quiescent windows so low-latency reads still see a current
    /// (zeroed) snapshot while the table stays free of empty rows.
    pub async fn cache_snapshot(&self, snapshot: &Snapshot) {
        if let Some(cache) = &self.cache {
            match cache.store_snapshot(snapshot).await {
                Ok(()) => {
                    self.cache_writes.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    warn!(error = %e, "cache update failed, continuing");
                }
            }
        }
    }

    /// Store one snapshot: update the cache, buffer the rows, and flush the
    /// batch when a threshold is met.
    ///
    /// Cache and flush failures are counted and logged but never propagate;
    /// a degraded store must not stall the pipeline.
    pub async fn store_metrics(&self, snapshot: &Snapshot) {
        self.cache_snapshot(snapshot).await;

        let due = {
            let mut batcher = self.batcher.lock().expect("batcher lock poisoned");
            batcher.push(flatten_snapshot(snapshot));
            batcher.try_flush()
        };

        if let Some(rows) = due {
            self.write_batch(rows).await;
        }
    }

    /// Drain any pending rows synchronously. Used during shutdown.
    pub async fn force_flush(&self) {
        let rows = {
            let mut batcher = self.batcher.lock().expect("batcher lock poisoned");
            batcher.flush()
        };
        if !rows.is_empty() {
            self.write_batch(rows).await;
        }
    }

    /// Execute one multi-row insert. On failure the rows are dropped —
    /// retrying would grow the buffer without bound under a dead store.
    async fn write_batch(&self, rows: Vec<MetricRow>) {
        let count = rows.len();
        match self.insert_rows(&rows).await {
            Ok(()) => {
                self.rows_written.fetch_add(count as u64, Ordering::Relaxed);
                self.batch_writes.fetch_add(1, Ordering::Relaxed);
                self.last_write_ok.store(true, Ordering::Relaxed);
                info!(rows = count, "metrics batch written");
            }
            Err(e) => {
                self.failed_writes.fetch_add(1, Ordering::Relaxed);
                self.last_write_ok.store(false, Ordering::Relaxed);
                warn!(rows = count, error = %e, "metrics batch write failed, dropping rows");
            }
        }
    }

    async fn insert_rows(&self, rows: &[MetricRow]) -> Result<(), StorageError> {
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO metrics_aggregated (timestamp, window_start, window_end, \
             service_name, endpoint, metric_type, qps, error_rate, avg_response_time, \
             p95_response_time, p99_response_time, total_requests, total_errors, \
             additional_data) ",
        );

        builder.push_values(rows, |mut b, row| {
            b.push_bind(row.timestamp)
                .push_bind(row.window_start)
                .push_bind(row.window_end)
                .push_bind(row.service_name.as_deref())
                .push_bind(row.endpoint.as_deref())
                .push_bind(row.metric_type.as_str())
                .push_bind(row.qps)
                .push_bind(row.error_rate)
                .push_bind(row.avg_response_time)
                .push_bind(row.p95_response_time)
                .push_bind(row.p99_response_time)
                .push_bind(row.total_requests)
                .push_bind(row.total_errors)
                .push_bind(row.additional_data.clone());
        });

        builder.build().execute(&self.pool).await?;
        Ok(())
    }

    /// Delete rows older than the retention cutoff. Returns the count.
    pub async fn cleanup_old_data(&self, retention_days: u32) -> Result<u64, StorageError> {
        let cutoff = Utc::now() - chrono::Duration::days(retention_days as i64);
        let result = sqlx::query("DELETE FROM metrics_aggregated WHERE timestamp < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        let deleted = result.rows_affected();
        info!(deleted, retention_days, "old metric rows cleaned up");
        Ok(deleted)
    }

    /// Close the connection pool. Call `force_flush` first.
    pub async fn close(&self) {
        self.pool.close().await;
        info!("storage manager closed");
    }

    /// Point-in-time statistics.
    pub fn stats(&self) -> StorageStats {
        StorageStats {
            rows_written: self.rows_written.load(Ordering::Relaxed),
            batch_writes: self.batch_writes.load(Ordering::Relaxed),
            failed_writes: self.failed_writes.load(Ordering::Relaxed),
            cache_writes: self.cache_writes.load(Ordering::Relaxed),
            pending_rows: self.batcher.lock().expect("batcher lock poisoned").len(),
            cache_configured: self.cache.is_some(),
            last_write_ok: self.last_write_ok.load(Ordering::Relaxed),
        }
    }
}
