//! Shard-local ingestion engine.
//!
//! Each shard owns a single ingestion thread that consumes a merged stream
//! of data batches and flush commands in arrival order. All writes to the
//! partition table, the index and active chunks happen on that thread, so
//! the hot path takes no locks beyond the per-partition builder guard.
//! Flush commands snapshot group state on the ingestion thread and hand the
//! frozen work to the flush pipeline.

use crate::config::StoreConfig;
use crate::error::{MemSeriesError, Result};
use crate::eviction::EvictionPolicy;
use crate::flush::{FlushGroup, FlushPart, FlushPipeline};
use crate::index::PartitionKeyIndex;
use crate::ingestion::FlushCommand;
use crate::partition::Partition;
use crate::partkey::{encode_partition_key, labels_from_key};
use crate::pool::BufferPool;
use crate::schema::Dataset;
use crate::table::PartitionTable;
use crate::{Record, RecordBatch};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Events consumed by the ingestion thread, strictly in arrival order.
pub enum ShardEvent {
    Data(RecordBatch),
    Flush(FlushCommand),
    Barrier(Sender<()>),
    Release(Sender<()>),
    Shutdown(Sender<()>),
}

/// Cheap snapshot of a shard's telemetry counters.
#[derive(Debug, Clone)]
pub struct ShardStats {
    pub rows_ingested: u64,
    pub rows_dropped: u64,
    pub partitions_created: u64,
    pub partitions_evicted: u64,
    pub flushes_completed: u64,
    pub flushes_failed: u64,
    pub latest_offset: i64,
    pub num_partitions: usize,
    pub pool_bytes_free: usize,
}

/// A shard-local ingestion engine over one dataset.
pub struct Shard {
    dataset: Arc<Dataset>,
    shard_num: u32,
    config: StoreConfig,
    pool: BufferPool,
    table: Arc<PartitionTable>,
    index: Arc<PartitionKeyIndex>,
    watermarks: Arc<Vec<AtomicI64>>,
    pipeline: FlushPipeline,
    policy: Box<dyn EvictionPolicy>,
    event_tx: Sender<ShardEvent>,
    ingest_thread: Mutex<Option<JoinHandle<()>>>,
    latest_offset: AtomicI64,
    tick: AtomicU64,
    next_part_id: AtomicU32,
    ttl_seconds: AtomicU32,
    rows_ingested: AtomicU64,
    rows_dropped: AtomicU64,
    partitions_created: AtomicU64,
    partitions_evicted: AtomicU64,
    stopped: AtomicBool,
}

impl Shard {
    /// Creates the shard and starts its ingestion thread.
    pub fn spawn(
        dataset: Arc<Dataset>,
        shard_num: u32,
        config: StoreConfig,
        pool: BufferPool,
        column_store: Arc<dyn crate::columnstore::ColumnStore>,
        publisher: Arc<dyn crate::downsample::DownsamplePublisher>,
        policy: Box<dyn EvictionPolicy>,
    ) -> Arc<Self> {
        let groups = config.groups_per_shard;
        let watermarks: Arc<Vec<AtomicI64>> =
            Arc::new((0..groups).map(|_| AtomicI64::new(-1)).collect());
        let pipeline = FlushPipeline::new(
            shard_num,
            groups,
            config.flush_task_parallelism,
            config.flush_retries,
            config.flush_retry_backoff,
            column_store,
            publisher,
            Arc::clone(&watermarks),
        );
        let (event_tx, event_rx) = bounded(config.ingest_queue_depth);

        let shard = Arc::new(Self {
            shard_num,
            pool,
            table: Arc::new(PartitionTable::new()),
            index: Arc::new(PartitionKeyIndex::new(shard_num, groups)),
            watermarks,
            pipeline,
            policy,
            event_tx,
            ingest_thread: Mutex::new(None),
            latest_offset: AtomicI64::new(-1),
            tick: AtomicU64::new(0),
            next_part_id: AtomicU32::new(0),
            ttl_seconds: AtomicU32::new(config.disk_time_to_live_seconds),
            rows_ingested: AtomicU64::new(0),
            rows_dropped: AtomicU64::new(0),
            partitions_created: AtomicU64::new(0),
            partitions_evicted: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
            config,
            dataset,
        });

        let runner = Arc::clone(&shard);
        let handle = std::thread::Builder::new()
            .name(format!("memseries-ingest-{shard_num}"))
            .spawn(move || runner.run(event_rx))
            .expect("spawn ingestion thread");
        *shard.ingest_thread.lock() = Some(handle);

        info!(shard = shard_num, groups, "shard started");
        shard
    }

    pub fn shard_num(&self) -> u32 {
        self.shard_num
    }

    pub fn dataset(&self) -> &Arc<Dataset> {
        &self.dataset
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn table(&self) -> &Arc<PartitionTable> {
        &self.table
    }

    pub fn index(&self) -> &Arc<PartitionKeyIndex> {
        &self.index
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Durable source offset of a group, `-1` until its first flush commits.
    pub fn watermark(&self, group: usize) -> i64 {
        self.watermarks
            .get(group)
            .map(|w| w.load(Ordering::Acquire))
            .unwrap_or(-1)
    }

    /// All group watermarks in group order.
    pub fn watermarks(&self) -> Vec<i64> {
        self.watermarks
            .iter()
            .map(|w| w.load(Ordering::Acquire))
            .collect()
    }

    /// Installs recovered checkpoints as the starting watermarks.
    pub fn install_checkpoints(&self, checkpoints: &std::collections::HashMap<usize, i64>) {
        for (&group, &offset) in checkpoints {
            if let Some(watermark) = self.watermarks.get(group) {
                watermark.store(offset, Ordering::Release);
            }
        }
    }

    /// Keeps fresh partition ids above everything a recovered index already
    /// uses.
    pub fn reserve_part_ids(&self, next: u32) {
        let mut current = self.next_part_id.load(Ordering::Acquire);
        while next > current {
            match self.next_part_id.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(now) => current = now,
            }
        }
    }

    /// Highest batch offset seen by the ingestion thread.
    pub fn latest_offset(&self) -> i64 {
        self.latest_offset.load(Ordering::Acquire)
    }

    /// TTL stamped onto durable chunk writes.
    pub fn set_ttl_seconds(&self, ttl: u32) {
        self.ttl_seconds.store(ttl, Ordering::Release);
    }

    pub fn stats(&self) -> ShardStats {
        ShardStats {
            rows_ingested: self.rows_ingested.load(Ordering::Acquire),
            rows_dropped: self.rows_dropped.load(Ordering::Acquire),
            partitions_created: self.partitions_created.load(Ordering::Acquire),
            partitions_evicted: self.partitions_evicted.load(Ordering::Acquire),
            flushes_completed: self.pipeline.flushes_completed(),
            flushes_failed: self.pipeline.flushes_failed(),
            latest_offset: self.latest_offset(),
            num_partitions: self.table.len(),
            pool_bytes_free: self.pool.bytes_free(),
        }
    }

    /// Enqueues a data batch. Blocks when the event queue is full.
    pub fn ingest(&self, batch: RecordBatch) -> Result<()> {
        self.send_event(ShardEvent::Data(batch))
    }

    /// Enqueues a flush command for one group.
    pub fn flush(&self, command: FlushCommand) -> Result<()> {
        self.send_event(ShardEvent::Flush(command))
    }

    fn send_event(&self, event: ShardEvent) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(MemSeriesError::ShuttingDown);
        }
        self.event_tx
            .send(event)
            .map_err(|_| MemSeriesError::ChannelSend {
                channel: format!("shard-{}", self.shard_num),
            })
    }

    /// Waits until every event enqueued so far has been processed.
    pub fn quiesce(&self) -> Result<()> {
        let (tx, rx) = bounded(1);
        self.send_event(ShardEvent::Barrier(tx))?;
        rx.recv()
            .map_err(|_| MemSeriesError::ChannelReceive {
                channel: format!("shard-{}", self.shard_num),
            })
    }

    /// Evicts every partition and frees pooled buffers, via the ingestion
    /// thread so table and index writes stay single-threaded.
    pub fn release_buffers(&self, timeout: Duration) -> Result<()> {
        let (tx, rx) = bounded(1);
        self.send_event(ShardEvent::Release(tx))?;
        rx.recv_timeout(timeout)
            .map_err(|_| MemSeriesError::ChannelReceive {
                channel: format!("shard-{}-release", self.shard_num),
            })
    }

    /// Waits for in-flight flush tasks to commit. On timeout the tasks keep
    /// running; their watermarks advance only if they eventually commit.
    pub fn drain_flushes(&self, timeout: Duration) -> Result<()> {
        self.pipeline.drain(timeout)
    }

    /// Drains in-flight flushes, then stops the ingestion thread. On drain
    /// timeout, in-flight flushes are abandoned and their watermarks left
    /// unchanged.
    pub fn stop(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let (tx, rx) = bounded(1);
        if self.event_tx.send(ShardEvent::Shutdown(tx)).is_ok() {
            let _ = rx.recv_timeout(self.config.flush_drain_timeout);
        }
        if let Some(handle) = self.ingest_thread.lock().take() {
            if handle.join().is_err() {
                error!(shard = self.shard_num, "ingestion thread panicked");
            }
        }

        match self.pipeline.drain(self.config.flush_drain_timeout) {
            Ok(()) => self.pipeline.shutdown(),
            Err(e) => {
                warn!(shard = self.shard_num, error = %e, "abandoning in-flight flushes");
                self.pipeline.abandon();
            }
        }
        info!(shard = self.shard_num, "shard stopped");
        Ok(())
    }

    fn run(&self, events: Receiver<ShardEvent>) {
        for event in events.iter() {
            match event {
                ShardEvent::Data(batch) => self.handle_data(batch),
                ShardEvent::Flush(command) => self.handle_flush(command),
                ShardEvent::Barrier(ack) => {
                    let _ = ack.send(());
                }
                ShardEvent::Release(ack) => {
                    self.release_all();
                    let _ = ack.send(());
                }
                ShardEvent::Shutdown(ack) => {
                    let _ = ack.send(());
                    break;
                }
            }
        }
        debug!(shard = self.shard_num, "ingestion thread exiting");
    }

    fn handle_data(&self, batch: RecordBatch) {
        let offset = batch.offset();
        for record in batch.records() {
            match self.ingest_record(record, offset) {
                Ok(()) => {
                    self.rows_ingested.fetch_add(1, Ordering::AcqRel);
                }
                Err(MemSeriesError::BufferPoolExhausted { .. }) => {
                    self.evict_for_headroom();
                    match self.ingest_record(record, offset) {
                        Ok(()) => {
                            self.rows_ingested.fetch_add(1, Ordering::AcqRel);
                        }
                        Err(e) => self.drop_record(offset, &e),
                    }
                }
                Err(e) => self.drop_record(offset, &e),
            }
        }

        let mut latest = self.latest_offset.load(Ordering::Acquire);
        while offset > latest {
            match self.latest_offset.compare_exchange_weak(
                latest,
                offset,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(now) => latest = now,
            }
        }
    }

    fn drop_record(&self, offset: i64, error: &MemSeriesError) {
        self.rows_dropped.fetch_add(1, Ordering::AcqRel);
        warn!(shard = self.shard_num, offset, error = %error, "dropping record");
    }

    fn ingest_record(&self, record: &Record, offset: i64) -> Result<()> {
        self.dataset.validate_record(record)?;
        let key = encode_partition_key(&self.dataset, record)?;
        let tick = self.tick.fetch_add(1, Ordering::AcqRel) + 1;
        let groups = self.config.groups_per_shard;

        let (partition, created) = self.table.get_or_create(&key, |hash| {
            // A series the recovered index already knows keeps its id so
            // restored postings and paged history stay addressable.
            let part_id = self
                .index
                .part_id_of(&key)
                .unwrap_or_else(|| self.next_part_id.fetch_add(1, Ordering::AcqRel));
            let group = (hash % groups as u64) as usize;
            Ok(Arc::new(Partition::new(
                part_id,
                group,
                &key,
                hash,
                &self.pool,
                self.config.max_chunks_size,
                self.config.chunks_to_keep,
                tick,
            )?))
        })?;

        if created {
            let labels = labels_from_key(&self.dataset, &key)?;
            self.index
                .add_key(partition.part_id(), partition.group(), key, labels);
            self.partitions_created.fetch_add(1, Ordering::AcqRel);
        }

        let chunk_values = &record.values()[self.dataset.row_key_pos()..];
        partition
            .ingest(&self.dataset, &self.pool, chunk_values, offset, tick)?;

        if let Some(ts) = self.dataset.timestamp_of(record) {
            self.index.observe(partition.part_id(), ts);
        }
        Ok(())
    }

    fn evict_for_headroom(&self) {
        loop {
            let victims = self.policy.select_victims(&self.table, 1);
            if victims.is_empty() {
                debug!(shard = self.shard_num, "no eviction candidates");
                return;
            }
            for victim in victims {
                self.evict_partition(&victim);
            }
            if !self.policy.should_evict(&self.pool) {
                return;
            }
        }
    }

    fn evict_partition(&self, partition: &Arc<Partition>) {
        debug!(
            shard = self.shard_num,
            part_id = partition.part_id(),
            "evicting partition"
        );
        partition.evict();
        self.table.remove(partition.key());
        self.index.remove_key(partition.part_id());
        self.partitions_evicted.fetch_add(1, Ordering::AcqRel);
    }

    fn handle_flush(&self, command: FlushCommand) {
        let group = command.group;
        if group >= self.config.groups_per_shard {
            warn!(shard = self.shard_num, group, "flush command for unknown group");
            return;
        }

        let mut parts = Vec::new();
        for partition in self.table.values() {
            if partition.group() != group {
                continue;
            }
            let slots = partition.switch_buffers();
            if !slots.is_empty() {
                parts.push(FlushPart { partition, slots });
            }
        }

        let bucket = match self.index.snapshot_bucket(group) {
            Ok(bucket) => bucket,
            Err(e) => {
                error!(shard = self.shard_num, group, error = %e, "bucket snapshot failed");
                return;
            }
        };

        let task = FlushGroup {
            dataset: self.dataset.name().to_string(),
            shard: self.shard_num,
            group,
            offset: self.latest_offset(),
            ttl_seconds: self.ttl_seconds.load(Ordering::Acquire),
            bucket,
            parts,
        };
        if let Err(e) = self.pipeline.submit(task) {
            error!(shard = self.shard_num, group, error = %e, "flush submit failed");
        }
    }

    fn release_all(&self) {
        for partition in self.table.values() {
            partition.evict();
            self.index.remove_key(partition.part_id());
        }
        self.table.clear();
        debug!(
            shard = self.shard_num,
            bytes_free = self.pool.bytes_free(),
            "released shard buffers"
        );
    }
}

impl Drop for Shard {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
