//! Shard configuration.

use crate::error::{MemSeriesError, Result};
use std::time::Duration;

/// Validated per-shard configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub groups_per_shard: usize,
    pub max_chunks_size: usize,
    pub chunks_to_keep: usize,
    pub ingestion_buffer_mem_size: usize,
    pub min_write_buffers_free: usize,
    pub flush_task_parallelism: usize,
    pub disk_time_to_live_seconds: u32,
    pub flush_drain_timeout: Duration,
    pub flush_retries: usize,
    pub flush_retry_backoff: Duration,
    pub ingest_queue_depth: usize,
}

impl StoreConfig {
    /// Starts a builder with default settings.
    pub fn builder() -> StoreConfigBuilder {
        StoreConfigBuilder::default()
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfigBuilder::default().build().expect("defaults are valid")
    }
}

/// Builder for [`StoreConfig`].
#[derive(Debug, Clone)]
pub struct StoreConfigBuilder {
    groups_per_shard: usize,
    max_chunks_size: usize,
    chunks_to_keep: usize,
    ingestion_buffer_mem_size: usize,
    min_write_buffers_free: usize,
    flush_task_parallelism: usize,
    disk_time_to_live_seconds: u32,
    flush_drain_timeout: Duration,
    flush_retries: usize,
    flush_retry_backoff: Duration,
    ingest_queue_depth: usize,
}

impl Default for StoreConfigBuilder {
    fn default() -> Self {
        Self {
            groups_per_shard: 8,
            max_chunks_size: 400,
            chunks_to_keep: 10,
            ingestion_buffer_mem_size: 64 * 1024 * 1024,
            min_write_buffers_free: 1024 * 1024,
            flush_task_parallelism: 2,
            disk_time_to_live_seconds: 24 * 3600,
            flush_drain_timeout: Duration::from_secs(30),
            flush_retries: 3,
            flush_retry_backoff: Duration::from_millis(50),
            ingest_queue_depth: 64,
        }
    }
}

impl StoreConfigBuilder {
    /// Number of flush groups per shard; fixed at shard creation.
    pub fn with_groups_per_shard(mut self, groups: usize) -> Self {
        self.groups_per_shard = groups;
        self
    }

    /// Maximum rows per chunk before rotation.
    pub fn with_max_chunks_size(mut self, rows: usize) -> Self {
        self.max_chunks_size = rows;
        self
    }

    /// Number of flushed chunk sets kept in memory per partition.
    pub fn with_chunks_to_keep(mut self, chunks: usize) -> Self {
        self.chunks_to_keep = chunks;
        self
    }

    /// Total byte budget for the dataset's write-buffer pool.
    pub fn with_ingestion_buffer_mem_size(mut self, bytes: usize) -> Self {
        self.ingestion_buffer_mem_size = bytes;
        self
    }

    /// Free-byte threshold below which eviction kicks in.
    pub fn with_min_write_buffers_free(mut self, bytes: usize) -> Self {
        self.min_write_buffers_free = bytes;
        self
    }

    /// Number of flush tasks run concurrently per shard.
    pub fn with_flush_task_parallelism(mut self, parallelism: usize) -> Self {
        self.flush_task_parallelism = parallelism;
        self
    }

    /// TTL applied to durable chunk writes.
    pub fn with_disk_time_to_live_seconds(mut self, seconds: u32) -> Self {
        self.disk_time_to_live_seconds = seconds;
        self
    }

    /// How long cancellation waits for in-flight flushes to drain.
    pub fn with_flush_drain_timeout(mut self, timeout: Duration) -> Self {
        self.flush_drain_timeout = timeout;
        self
    }

    /// Retry attempts for transient flush failures.
    pub fn with_flush_retries(mut self, retries: usize) -> Self {
        self.flush_retries = retries;
        self
    }

    /// Base backoff between flush retries; doubles per attempt.
    pub fn with_flush_retry_backoff(mut self, backoff: Duration) -> Self {
        self.flush_retry_backoff = backoff;
        self
    }

    /// Depth of the shard's ingestion event queue.
    pub fn with_ingest_queue_depth(mut self, depth: usize) -> Self {
        self.ingest_queue_depth = depth;
        self
    }

    /// Validates and builds the configuration.
    pub fn build(self) -> Result<StoreConfig> {
        if self.groups_per_shard == 0 {
            return Err(MemSeriesError::InvalidConfiguration(
                "groups_per_shard must be at least 1".to_string(),
            ));
        }
        if self.max_chunks_size == 0 {
            return Err(MemSeriesError::InvalidConfiguration(
                "max_chunks_size must be at least 1 row".to_string(),
            ));
        }
        if self.chunks_to_keep == 0 {
            return Err(MemSeriesError::InvalidConfiguration(
                "chunks_to_keep must be at least 1".to_string(),
            ));
        }
        if self.flush_task_parallelism == 0 {
            return Err(MemSeriesError::InvalidConfiguration(
                "flush_task_parallelism must be at least 1".to_string(),
            ));
        }
        if self.ingest_queue_depth == 0 {
            return Err(MemSeriesError::InvalidConfiguration(
                "ingest_queue_depth must be at least 1".to_string(),
            ));
        }
        if self.min_write_buffers_free >= self.ingestion_buffer_mem_size {
            return Err(MemSeriesError::InvalidConfiguration(format!(
                "min_write_buffers_free ({}) must be below ingestion_buffer_mem_size ({})",
                self.min_write_buffers_free, self.ingestion_buffer_mem_size
            )));
        }

        Ok(StoreConfig {
            groups_per_shard: self.groups_per_shard,
            max_chunks_size: self.max_chunks_size,
            chunks_to_keep: self.chunks_to_keep,
            ingestion_buffer_mem_size: self.ingestion_buffer_mem_size,
            min_write_buffers_free: self.min_write_buffers_free,
            flush_task_parallelism: self.flush_task_parallelism,
            disk_time_to_live_seconds: self.disk_time_to_live_seconds,
            flush_drain_timeout: self.flush_drain_timeout,
            flush_retries: self.flush_retries,
            flush_retry_backoff: self.flush_retry_backoff,
            ingest_queue_depth: self.ingest_queue_depth,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_build_successfully() {
        let config = StoreConfig::default();
        assert_eq!(config.groups_per_shard, 8);
        assert_eq!(config.max_chunks_size, 400);
    }

    #[test]
    fn build_rejects_zero_groups() {
        let result = StoreConfig::builder().with_groups_per_shard(0).build();
        assert!(matches!(
            result,
            Err(MemSeriesError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn build_rejects_free_threshold_at_or_above_budget() {
        let result = StoreConfig::builder()
            .with_ingestion_buffer_mem_size(1024)
            .with_min_write_buffers_free(1024)
            .build();
        assert!(matches!(
            result,
            Err(MemSeriesError::InvalidConfiguration(_))
        ));
    }
}
