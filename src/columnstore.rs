//! Durable column-store interface and an in-memory implementation.
//!
//! The memstore persists nothing itself: flush units addressed by
//! `(dataset, shard, group, offset)` are handed to a [`ColumnStore`], and
//! historical chunks are paged back in through it. The in-memory
//! implementation keeps writes idempotent under retry and can inject
//! failures for exercising the flush pipeline.

use crate::error::{MemSeriesError, Result};
use crate::index::ColumnFilter;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;

/// How to select partitions for a raw read.
#[derive(Debug, Clone)]
pub enum PartitionScanMethod {
    All,
    ByKeys(Vec<Vec<u8>>),
    ByFilters(Vec<ColumnFilter>),
}

/// How to select chunks within a partition.
#[derive(Debug, Clone, Copy)]
pub enum ChunkScanMethod {
    All,
    TimeRange { start: i64, end: i64 },
}

impl ChunkScanMethod {
    /// The inclusive window this method selects.
    pub fn window(&self) -> (i64, i64) {
        match self {
            ChunkScanMethod::All => (i64::MIN, i64::MAX),
            ChunkScanMethod::TimeRange { start, end } => (*start, *end),
        }
    }
}

/// One partition's frozen chunks as written by a flush task.
#[derive(Debug, Clone)]
pub struct PartChunkSet {
    pub part_key: Vec<u8>,
    pub chunks: Vec<Bytes>,
}

/// Raw partition data returned by the durable store.
#[derive(Debug, Clone)]
pub struct RawPartData {
    pub part_key: Vec<u8>,
    pub chunks: Vec<Bytes>,
}

/// Durable sink and source for chunk sets and index time buckets.
pub trait ColumnStore: Send + Sync {
    /// Persists the chunk sets of one flush unit. Must be idempotent under
    /// retry for the same `(dataset, shard, group, offset)`.
    fn write_chunks(
        &self,
        dataset: &str,
        shard: u32,
        group: usize,
        offset: i64,
        chunks: &[PartChunkSet],
        ttl_seconds: u32,
    ) -> Result<()>;

    /// Persists the index time bucket of one flush unit.
    fn write_index_time_bucket(
        &self,
        dataset: &str,
        shard: u32,
        group: usize,
        offset: i64,
        bucket: &[u8],
    ) -> Result<()>;

    /// Reads raw partition chunks for the selected partitions and window.
    fn read_raw_partitions(
        &self,
        dataset: &str,
        column_ids: &[u16],
        part_method: &PartitionScanMethod,
        chunk_method: &ChunkScanMethod,
    ) -> Result<Vec<RawPartData>>;

    /// All persisted index buckets of a shard, oldest snapshot first per
    /// group.
    fn scan_index_buckets(&self, dataset: &str, shard: u32) -> Result<Vec<Vec<u8>>>;

    /// Drops all persisted state of a dataset.
    fn truncate(&self, dataset: &str) -> Result<()>;

    /// Drops everything.
    fn reset(&self) -> Result<()>;
}

type FlushAddr = (String, u32, usize, i64);

#[derive(Default)]
struct FaultPlan {
    fail_next: usize,
    transient: bool,
}

/// In-memory [`ColumnStore`] used by tests and single-process deployments.
pub struct MemoryColumnStore {
    chunk_writes: DashMap<FlushAddr, Vec<PartChunkSet>>,
    bucket_writes: DashMap<FlushAddr, Vec<u8>>,
    faults: Mutex<FaultPlan>,
}

impl MemoryColumnStore {
    pub fn new() -> Self {
        Self {
            chunk_writes: DashMap::new(),
            bucket_writes: DashMap::new(),
            faults: Mutex::new(FaultPlan::default()),
        }
    }

    /// Makes the next `n` writes fail, transiently or permanently.
    pub fn fail_next_writes(&self, n: usize, transient: bool) {
        let mut faults = self.faults.lock();
        faults.fail_next = n;
        faults.transient = transient;
    }

    fn check_fault(&self, operation: &str) -> Result<()> {
        let mut faults = self.faults.lock();
        if faults.fail_next > 0 {
            faults.fail_next -= 1;
            return Err(MemSeriesError::FlushIo {
                details: format!("injected {operation} failure"),
                transient: faults.transient,
            });
        }
        Ok(())
    }

    /// Persisted chunk sets of a shard, ordered by `(group, offset)`.
    pub fn chunk_sets(&self, dataset: &str, shard: u32) -> Vec<(usize, i64, PartChunkSet)> {
        let mut out = Vec::new();
        for entry in self.chunk_writes.iter() {
            let (ds, sh, group, offset) = entry.key();
            if ds == dataset && *sh == shard {
                for set in entry.value() {
                    out.push((*group, *offset, set.clone()));
                }
            }
        }
        out.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
        out
    }

    /// Total rows persisted for a shard, decoded from the chunk headers.
    pub fn persisted_rows(&self, dataset: &str, shard: u32) -> usize {
        self.chunk_sets(dataset, shard)
            .iter()
            .flat_map(|(_, _, set)| set.chunks.iter())
            .filter_map(|bytes| crate::chunk::Chunk::decode(bytes.clone()).ok())
            .map(|chunk| chunk.row_count())
            .sum()
    }
}

impl Default for MemoryColumnStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ColumnStore for MemoryColumnStore {
    fn write_chunks(
        &self,
        dataset: &str,
        shard: u32,
        group: usize,
        offset: i64,
        chunks: &[PartChunkSet],
        _ttl_seconds: u32,
    ) -> Result<()> {
        self.check_fault("write_chunks")?;
        // Rewrites of the same flush address replace, keeping retries
        // idempotent.
        self.chunk_writes.insert(
            (dataset.to_string(), shard, group, offset),
            chunks.to_vec(),
        );
        Ok(())
    }

    fn write_index_time_bucket(
        &self,
        dataset: &str,
        shard: u32,
        group: usize,
        offset: i64,
        bucket: &[u8],
    ) -> Result<()> {
        self.check_fault("write_index_time_bucket")?;
        self.bucket_writes.insert(
            (dataset.to_string(), shard, group, offset),
            bucket.to_vec(),
        );
        Ok(())
    }

    fn read_raw_partitions(
        &self,
        dataset: &str,
        _column_ids: &[u16],
        part_method: &PartitionScanMethod,
        chunk_method: &ChunkScanMethod,
    ) -> Result<Vec<RawPartData>> {
        let wanted = |key: &[u8]| match part_method {
            PartitionScanMethod::All => true,
            PartitionScanMethod::ByKeys(keys) => keys.iter().any(|k| k == key),
            // Filters are resolved to keys by the memstore before reaching
            // the durable store.
            PartitionScanMethod::ByFilters(_) => false,
        };
        let (start, end) = chunk_method.window();

        let mut by_key: Vec<RawPartData> = Vec::new();
        let mut sets: Vec<(FlushAddr, Vec<PartChunkSet>)> = self
            .chunk_writes
            .iter()
            .filter(|entry| entry.key().0 == dataset)
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        sets.sort_by(|a, b| (a.0 .2, a.0 .3).cmp(&(b.0 .2, b.0 .3)));

        for (_, chunk_sets) in sets {
            for set in chunk_sets {
                if !wanted(&set.part_key) {
                    continue;
                }
                let selected: Vec<Bytes> = set
                    .chunks
                    .iter()
                    .filter(|bytes| {
                        crate::chunk::Chunk::decode((*bytes).clone())
                            .map(|c| c.intersects(start, end))
                            .unwrap_or(false)
                    })
                    .cloned()
                    .collect();
                if selected.is_empty() {
                    continue;
                }
                match by_key.iter_mut().find(|p| p.part_key == set.part_key) {
                    Some(existing) => existing.chunks.extend(selected),
                    None => by_key.push(RawPartData {
                        part_key: set.part_key.clone(),
                        chunks: selected,
                    }),
                }
            }
        }
        Ok(by_key)
    }

    fn scan_index_buckets(&self, dataset: &str, shard: u32) -> Result<Vec<Vec<u8>>> {
        let mut buckets: Vec<((usize, i64), Vec<u8>)> = self
            .bucket_writes
            .iter()
            .filter(|entry| entry.key().0 == dataset && entry.key().1 == shard)
            .map(|entry| ((entry.key().2, entry.key().3), entry.value().clone()))
            .collect();
        buckets.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(buckets.into_iter().map(|(_, blob)| blob).collect())
    }

    fn truncate(&self, dataset: &str) -> Result<()> {
        self.chunk_writes.retain(|key, _| key.0 != dataset);
        self.bucket_writes.retain(|key, _| key.0 != dataset);
        Ok(())
    }

    fn reset(&self) -> Result<()> {
        self.chunk_writes.clear();
        self.bucket_writes.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk_bytes(ts: i64) -> Bytes {
        use crate::chunk::ChunkBuilder;
        use crate::pool::BufferPool;
        use crate::schema::{Column, ColumnKind, Dataset};
        use crate::FieldValue;

        let dataset = Dataset::new(
            "ts",
            vec![Column::new("tags", ColumnKind::Map)],
            vec![Column::new("timestamp", ColumnKind::Long)],
            vec![Column::new("value", ColumnKind::Double)],
        )
        .unwrap();
        let pool = BufferPool::new(1024 * 1024, "test");
        let mut builder = ChunkBuilder::new(&dataset, &pool, 4).unwrap();
        builder
            .append(&[FieldValue::Long(ts), FieldValue::Double(1.0)])
            .unwrap();
        builder.freeze().unwrap().bytes()
    }

    fn one_set(ts: i64) -> Vec<PartChunkSet> {
        vec![PartChunkSet {
            part_key: b"key".to_vec(),
            chunks: vec![chunk_bytes(ts)],
        }]
    }

    #[test]
    fn rewriting_a_flush_address_is_idempotent() {
        let store = MemoryColumnStore::new();
        store.write_chunks("ts", 0, 0, 5, &one_set(1), 60).unwrap();
        store.write_chunks("ts", 0, 0, 5, &one_set(1), 60).unwrap();
        assert_eq!(store.persisted_rows("ts", 0), 1);
    }

    #[test]
    fn injected_faults_fail_the_requested_number_of_writes() {
        let store = MemoryColumnStore::new();
        store.fail_next_writes(2, true);

        let err = store.write_chunks("ts", 0, 0, 5, &one_set(1), 60).unwrap_err();
        assert!(err.is_transient());
        assert!(store.write_chunks("ts", 0, 0, 5, &one_set(1), 60).is_err());
        assert!(store.write_chunks("ts", 0, 0, 5, &one_set(1), 60).is_ok());
    }

    #[test]
    fn read_raw_partitions_filters_by_key_and_window() {
        let store = MemoryColumnStore::new();
        store.write_chunks("ts", 0, 0, 5, &one_set(10), 60).unwrap();
        store.write_chunks("ts", 0, 0, 9, &one_set(20), 60).unwrap();

        let all = store
            .read_raw_partitions(
                "ts",
                &[0, 1],
                &PartitionScanMethod::ByKeys(vec![b"key".to_vec()]),
                &ChunkScanMethod::All,
            )
            .unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].chunks.len(), 2);

        let windowed = store
            .read_raw_partitions(
                "ts",
                &[0, 1],
                &PartitionScanMethod::ByKeys(vec![b"key".to_vec()]),
                &ChunkScanMethod::TimeRange { start: 15, end: 25 },
            )
            .unwrap();
        assert_eq!(windowed[0].chunks.len(), 1);

        let missing = store
            .read_raw_partitions(
                "ts",
                &[0, 1],
                &PartitionScanMethod::ByKeys(vec![b"other".to_vec()]),
                &ChunkScanMethod::All,
            )
            .unwrap();
        assert!(missing.is_empty());
    }

    #[test]
    fn index_buckets_come_back_in_group_offset_order() {
        let store = MemoryColumnStore::new();
        store.write_index_time_bucket("ts", 0, 1, 9, b"g1o9").unwrap();
        store.write_index_time_bucket("ts", 0, 0, 5, b"g0o5").unwrap();
        store.write_index_time_bucket("ts", 0, 0, 9, b"g0o9").unwrap();

        let buckets = store.scan_index_buckets("ts", 0).unwrap();
        assert_eq!(buckets, vec![b"g0o5".to_vec(), b"g0o9".to_vec(), b"g1o9".to_vec()]);
    }

    #[test]
    fn truncate_drops_only_the_dataset() {
        let store = MemoryColumnStore::new();
        store.write_chunks("a", 0, 0, 1, &one_set(1), 60).unwrap();
        store.write_chunks("b", 0, 0, 1, &one_set(1), 60).unwrap();

        store.truncate("a").unwrap();
        assert_eq!(store.persisted_rows("a", 0), 0);
        assert_eq!(store.persisted_rows("b", 0), 1);
    }
}
