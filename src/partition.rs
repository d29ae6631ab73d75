//! Per-series partition state.
//!
//! A partition owns the active append chunk and the bounded run of frozen
//! chunks for one partition key. All mutations happen on the shard's
//! ingestion thread; readers work against frozen chunks and a briefly locked
//! view of the active builder.

use crate::chunk::{Chunk, ChunkBuilder};
use crate::error::Result;
use crate::pool::{BufferPool, PoolBuffer};
use crate::schema::Dataset;
use crate::FieldValue;
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

const STATE_ACTIVE: u8 = 0;
const STATE_FLUSHING: u8 = 1;
const STATE_EVICTED: u8 = 2;

/// Lifecycle state of a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionState {
    Active,
    Flushing,
    Evicted,
}

/// A frozen chunk awaiting (or past) durable persistence.
pub struct ChunkSlot {
    chunk: Chunk,
    persisted: AtomicBool,
}

impl ChunkSlot {
    pub fn chunk(&self) -> &Chunk {
        &self.chunk
    }

    pub fn is_persisted(&self) -> bool {
        self.persisted.load(Ordering::Acquire)
    }

    /// Marks the slot durable. Called by the flush pipeline on commit.
    pub fn mark_persisted(&self) {
        self.persisted.store(true, Ordering::Release);
    }
}

/// Per-series state: active chunk, frozen chunks, offsets and group id.
pub struct Partition {
    part_id: u32,
    group: usize,
    key_buf: PoolBuffer,
    key_len: usize,
    key_hash: u64,
    max_chunk_rows: usize,
    chunks_to_keep: usize,
    active: RwLock<Option<ChunkBuilder>>,
    flushed: RwLock<VecDeque<Arc<ChunkSlot>>>,
    ingested_rows: AtomicU64,
    first_offset: AtomicI64,
    last_offset: AtomicI64,
    last_ingest_tick: AtomicU64,
    state: AtomicU8,
}

impl Partition {
    /// Creates a partition owning `key` bytes held in pooled memory.
    /// `tick` seeds the ingest clock so a fresh partition is never the
    /// least-recently-ingested eviction candidate.
    pub fn new(
        part_id: u32,
        group: usize,
        key: &[u8],
        key_hash: u64,
        pool: &BufferPool,
        max_chunk_rows: usize,
        chunks_to_keep: usize,
        tick: u64,
    ) -> Result<Self> {
        let mut key_buf = pool.allocate(key.len())?;
        key_buf[..key.len()].copy_from_slice(key);
        Ok(Self {
            part_id,
            group,
            key_buf,
            key_len: key.len(),
            key_hash,
            max_chunk_rows,
            chunks_to_keep,
            active: RwLock::new(None),
            flushed: RwLock::new(VecDeque::new()),
            ingested_rows: AtomicU64::new(0),
            first_offset: AtomicI64::new(-1),
            last_offset: AtomicI64::new(-1),
            last_ingest_tick: AtomicU64::new(tick),
            state: AtomicU8::new(STATE_ACTIVE),
        })
    }

    pub fn part_id(&self) -> u32 {
        self.part_id
    }

    pub fn group(&self) -> usize {
        self.group
    }

    pub fn key(&self) -> &[u8] {
        &self.key_buf[..self.key_len]
    }

    pub fn key_hash(&self) -> u64 {
        self.key_hash
    }

    pub fn state(&self) -> PartitionState {
        match self.state.load(Ordering::Acquire) {
            STATE_FLUSHING => PartitionState::Flushing,
            STATE_EVICTED => PartitionState::Evicted,
            _ => PartitionState::Active,
        }
    }

    pub fn ingested_rows(&self) -> u64 {
        self.ingested_rows.load(Ordering::Acquire)
    }

    pub fn first_offset(&self) -> i64 {
        self.first_offset.load(Ordering::Acquire)
    }

    pub fn last_offset(&self) -> i64 {
        self.last_offset.load(Ordering::Acquire)
    }

    /// Logical tick of the last ingested row; drives eviction ordering.
    pub fn last_ingest_tick(&self) -> u64 {
        self.last_ingest_tick.load(Ordering::Acquire)
    }

    /// Appends one row's chunk-column values. Rotates the active chunk when
    /// full. Ingestion thread only; `BufferPoolExhausted` surfaces to the
    /// caller so it can evict and retry.
    pub fn ingest(
        &self,
        dataset: &Dataset,
        pool: &BufferPool,
        values: &[FieldValue],
        offset: i64,
        tick: u64,
    ) -> Result<()> {
        {
            let mut active = self.active.write();
            if active.as_ref().is_some_and(ChunkBuilder::is_full) {
                if let Some(chunk) = active.take().and_then(ChunkBuilder::freeze) {
                    self.push_frozen(chunk);
                }
            }
            if active.is_none() {
                *active = Some(ChunkBuilder::new(dataset, pool, self.max_chunk_rows)?);
            }
            active
                .as_mut()
                .expect("active builder just ensured")
                .append(values)?;
        }

        self.ingested_rows.fetch_add(1, Ordering::AcqRel);
        let _ = self.first_offset.compare_exchange(
            -1,
            offset,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.last_offset.store(offset, Ordering::Release);
        self.last_ingest_tick.store(tick, Ordering::Release);
        self.state.store(STATE_ACTIVE, Ordering::Release);
        Ok(())
    }

    fn push_frozen(&self, chunk: Chunk) {
        let mut flushed = self.flushed.write();
        flushed.push_back(Arc::new(ChunkSlot {
            chunk,
            persisted: AtomicBool::new(false),
        }));
    }

    /// Freezes the active chunk unconditionally and returns every frozen
    /// chunk not yet durably persisted, oldest first. Marks the partition
    /// Flushing when it produced candidates. Ingestion thread only.
    pub fn switch_buffers(&self) -> Vec<Arc<ChunkSlot>> {
        if let Some(chunk) = self.active.write().take().and_then(ChunkBuilder::freeze) {
            self.push_frozen(chunk);
        }

        let candidates: Vec<Arc<ChunkSlot>> = self
            .flushed
            .read()
            .iter()
            .filter(|slot| !slot.is_persisted())
            .cloned()
            .collect();
        if !candidates.is_empty() {
            self.state.store(STATE_FLUSHING, Ordering::Release);
        }
        candidates
    }

    /// Clears the Flushing state and drops persisted chunks beyond the
    /// in-memory retention bound. Called by the flush pipeline on commit.
    pub fn end_flush(&self) {
        let mut flushed = self.flushed.write();
        while flushed.len() > self.chunks_to_keep {
            match flushed.front() {
                Some(slot) if slot.is_persisted() => {
                    flushed.pop_front();
                }
                _ => break,
            }
        }
        drop(flushed);
        let _ = self.state.compare_exchange(
            STATE_FLUSHING,
            STATE_ACTIVE,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Frozen chunk handles whose time range intersects `[start, end]`,
    /// oldest first. Safe from any thread.
    pub fn chunks_in_range(&self, start: i64, end: i64) -> Vec<Chunk> {
        self.flushed
            .read()
            .iter()
            .filter(|slot| slot.chunk.intersects(start, end))
            .map(|slot| slot.chunk.clone())
            .collect()
    }

    /// Materialized rows of the selected columns within `[start, end]`,
    /// frozen chunks first, then the active chunk. Safe from any thread.
    pub fn read_rows(&self, column_ids: &[u16], start: i64, end: i64) -> Vec<Vec<FieldValue>> {
        let mut rows = Vec::new();
        for chunk in self.chunks_in_range(start, end) {
            rows.extend(chunk.rows_in_range(column_ids, start, end));
        }
        if let Some(builder) = self.active.read().as_ref() {
            rows.extend(builder.rows_in_range(column_ids, start, end));
        }
        rows
    }

    /// Smallest row-key timestamp still resident in memory, if any.
    pub fn min_resident_timestamp(&self) -> Option<i64> {
        let from_frozen = self
            .flushed
            .read()
            .front()
            .map(|slot| slot.chunk.min_timestamp());
        let from_active = self
            .active
            .read()
            .as_ref()
            .and_then(ChunkBuilder::min_timestamp);
        match (from_frozen, from_active) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Approximate pooled bytes a fresh row for this partition would need.
    pub fn resident_chunks(&self) -> usize {
        self.flushed.read().len()
    }

    /// Releases pooled buffers and marks the partition Evicted. Ingestion
    /// thread only; the caller removes it from the table and index.
    pub fn evict(&self) {
        self.state.store(STATE_EVICTED, Ordering::Release);
        *self.active.write() = None;
        self.flushed.write().clear();
    }
}
