//! Eviction policies for reclaiming write-buffer memory.

use crate::partition::{Partition, PartitionState};
use crate::pool::BufferPool;
use crate::table::PartitionTable;
use std::sync::Arc;

/// Decides when to evict and which partitions to reclaim.
pub trait EvictionPolicy: Send + Sync {
    /// True when the pool is tight enough that eviction should run.
    fn should_evict(&self, pool: &BufferPool) -> bool;

    /// Up to `n` victims, best candidates first. Partitions in the Flushing
    /// state must be skipped.
    fn select_victims(&self, table: &PartitionTable, n: usize) -> Vec<Arc<Partition>>;
}

/// Default policy: evict the least-recently-ingested partitions whenever the
/// pool's free bytes drop below a threshold.
pub struct WriteBufferFreeEvictionPolicy {
    min_write_buffers_free: usize,
}

impl WriteBufferFreeEvictionPolicy {
    pub fn new(min_write_buffers_free: usize) -> Self {
        Self {
            min_write_buffers_free,
        }
    }
}

impl EvictionPolicy for WriteBufferFreeEvictionPolicy {
    fn should_evict(&self, pool: &BufferPool) -> bool {
        pool.bytes_free() < self.min_write_buffers_free
    }

    fn select_victims(&self, table: &PartitionTable, n: usize) -> Vec<Arc<Partition>> {
        let mut candidates: Vec<Arc<Partition>> = table
            .values()
            .into_iter()
            .filter(|p| p.state() != PartitionState::Flushing)
            .collect();
        // Oldest ingest first; ties break on the key bytes so the order is
        // stable across runs.
        candidates.sort_by(|a, b| {
            a.last_ingest_tick()
                .cmp(&b.last_ingest_tick())
                .then_with(|| a.key().cmp(b.key()))
        });
        candidates.truncate(n);
        candidates
    }
}
