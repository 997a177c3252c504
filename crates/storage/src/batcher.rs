//! Row batch accumulator.
//!
//! Collects [`MetricRow`]s and flushes when either the size threshold or
//! the time window since the last flush is reached, whichever comes first.
//! This balances write throughput (larger inserts) with durability latency.

use std::time::{Duration, Instant};

use crate::rows::MetricRow;

/// Accumulates pending rows into insert batches.
pub struct MetricsBatcher {
    buffer: Vec<MetricRow>,
    max_size: usize,
    max_wait: Duration,
    last_flush: Instant,
}

impl MetricsBatcher {
    /// Create a batcher with the given size and time thresholds.
    ///
    /// - `max_size`: flush when this many rows are buffered.
    /// - `max_wait`: flush when this duration has elapsed since the last
    ///   flush (or since construction).
    pub fn new(max_size: usize, max_wait: Duration) -> Self {
        Self {
            buffer: Vec::with_capacity(max_size),
            max_size,
            max_wait,
            last_flush: Instant::now(),
        }
    }

    /// Add rows to the pending batch.
    pub fn push(&mut self, rows: Vec<MetricRow>) {
        self.buffer.extend(rows);
    }

    /// Whether the pending batch should be flushed now.
    pub fn should_flush(&self) -> bool {
        if self.buffer.is_empty() {
            return false;
        }
        self.buffer.len() >= self.max_size || self.last_flush.elapsed() >= self.max_wait
    }

    /// Take all pending rows and reset the flush timer.
    pub fn flush(&mut self) -> Vec<MetricRow> {
        self.last_flush = Instant::now();
        std::mem::take(&mut self.buffer)
    }

    /// Flush only if a threshold is met, otherwise `None`.
    pub fn try_flush(&mut self) -> Option<Vec<MetricRow>> {
        if self.should_flush() {
            Some(self.flush())
        } else {
            None
        }
    }

    /// Number of rows currently pending.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}
