//! Concurrent partition table.
//!
//! Maps opaque partition-key bytes to partitions. Keys are grouped into
//! buckets by their 64-bit hash; each bucket stores full keys so equality
//! never trusts the hash alone. Creation and removal are ingestion-thread
//! only; `get` and `values` are safe from any thread.

use crate::error::Result;
use crate::partition::Partition;
use crate::partkey::hash_key;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Concurrent map: partition-key bytes -> partition.
pub struct PartitionTable {
    buckets: DashMap<u64, Vec<Arc<Partition>>>,
    len: AtomicUsize,
}

impl PartitionTable {
    pub fn new() -> Self {
        Self {
            buckets: DashMap::new(),
            len: AtomicUsize::new(0),
        }
    }

    /// Looks up a partition, creating it with `create` when absent. Returns
    /// the partition and whether it was created. Ingestion thread only.
    pub fn get_or_create<F>(&self, key: &[u8], create: F) -> Result<(Arc<Partition>, bool)>
    where
        F: FnOnce(u64) -> Result<Arc<Partition>>,
    {
        let hash = hash_key(key);
        let mut bucket = self.buckets.entry(hash).or_default();
        if let Some(existing) = bucket.iter().find(|p| p.key() == key) {
            return Ok((Arc::clone(existing), false));
        }
        let partition = create(hash)?;
        bucket.push(Arc::clone(&partition));
        self.len.fetch_add(1, Ordering::AcqRel);
        Ok((partition, true))
    }

    /// Looks up a partition by key bytes. Safe from any thread.
    pub fn get(&self, key: &[u8]) -> Option<Arc<Partition>> {
        let hash = hash_key(key);
        self.buckets
            .get(&hash)
            .and_then(|bucket| bucket.iter().find(|p| p.key() == key).map(Arc::clone))
    }

    /// Removes a partition by key bytes. Ingestion thread only.
    pub fn remove(&self, key: &[u8]) -> Option<Arc<Partition>> {
        let hash = hash_key(key);
        let mut removed = None;
        if let Some(mut bucket) = self.buckets.get_mut(&hash) {
            if let Some(at) = bucket.iter().position(|p| p.key() == key) {
                removed = Some(bucket.remove(at));
            }
        }
        if removed.is_some() {
            self.len.fetch_sub(1, Ordering::AcqRel);
            self.buckets.remove_if(&hash, |_, bucket| bucket.is_empty());
        }
        removed
    }

    /// Weakly consistent snapshot of all partitions.
    pub fn values(&self) -> Vec<Arc<Partition>> {
        let mut out = Vec::with_capacity(self.len());
        for bucket in self.buckets.iter() {
            out.extend(bucket.iter().map(Arc::clone));
        }
        out
    }

    /// Number of partitions currently in the table.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every partition. Shutdown path only.
    pub fn clear(&self) {
        self.buckets.clear();
        self.len.store(0, Ordering::Release);
    }
}

impl Default for PartitionTable {
    fn default() -> Self {
        Self::new()
    }
}
