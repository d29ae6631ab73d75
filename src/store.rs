//! The memstore façade.
//!
//! Owns the per-dataset resources (write-buffer pool, downsample publisher,
//! shard registry) and exposes ingestion, recovery, scans and label lookups.
//! Nothing here is process-global: every arena and publisher lives inside
//! the `MemStore` instance that created it.

use crate::chunk::Chunk;
use crate::columnstore::{ChunkScanMethod, ColumnStore, PartitionScanMethod};
use crate::config::StoreConfig;
use crate::downsample::{DownsamplePublisher, NopPublisher};
use crate::error::{MemSeriesError, Result};
use crate::eviction::WriteBufferFreeEvictionPolicy;
use crate::index::ColumnFilter;
use crate::ingestion::{FlushCommand, IngestionStream, RecoveryEvent};
use crate::pool::BufferPool;
use crate::schema::{Dataset, Projection};
use crate::shard::Shard;
use crate::{FieldValue, RecordBatch};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{error, info, warn};

struct DatasetResources {
    dataset: Arc<Dataset>,
    pool: BufferPool,
    publisher: Arc<dyn DownsamplePublisher>,
    shards: DashMap<u32, Arc<Shard>>,
    active_streams: DashMap<u32, ()>,
}

/// Per-node registry of datasets and their shard-local ingestion engines.
pub struct MemStore {
    column_store: Arc<dyn ColumnStore>,
    datasets: DashMap<String, Arc<DatasetResources>>,
    open: AtomicBool,
}

impl MemStore {
    pub fn new(column_store: Arc<dyn ColumnStore>) -> Self {
        Self {
            column_store,
            datasets: DashMap::new(),
            open: AtomicBool::new(true),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(MemSeriesError::ShuttingDown)
        }
    }

    /// Initializes a shard of a dataset. Per-dataset resources (pool,
    /// publisher) are created lazily on the first shard.
    pub fn setup(
        &self,
        dataset: Dataset,
        shard: u32,
        config: StoreConfig,
        publisher: Option<Arc<dyn DownsamplePublisher>>,
    ) -> Result<()> {
        self.ensure_open()?;
        let name = dataset.name().to_string();

        let resources = self
            .datasets
            .entry(name.clone())
            .or_insert_with(|| {
                let publisher = publisher
                    .clone()
                    .unwrap_or_else(|| Arc::new(NopPublisher) as Arc<dyn DownsamplePublisher>);
                if let Err(e) = publisher.start() {
                    warn!(dataset = %name, error = %e, "downsample publisher failed to start");
                }
                Arc::new(DatasetResources {
                    dataset: Arc::new(dataset.clone()),
                    pool: BufferPool::new(config.ingestion_buffer_mem_size, name.clone()),
                    publisher,
                    shards: DashMap::new(),
                    active_streams: DashMap::new(),
                })
            })
            .clone();

        if resources.shards.contains_key(&shard) {
            return Err(MemSeriesError::ShardAlreadySetup {
                dataset: name,
                shard,
            });
        }

        let policy = Box::new(WriteBufferFreeEvictionPolicy::new(
            config.min_write_buffers_free,
        ));
        let engine = Shard::spawn(
            Arc::clone(&resources.dataset),
            shard,
            config,
            resources.pool.clone(),
            Arc::clone(&self.column_store),
            Arc::clone(&resources.publisher),
            policy,
        );
        resources.shards.insert(shard, engine);
        info!(dataset = %name, shard, "shard set up");
        Ok(())
    }

    fn resources(&self, dataset: &str) -> Option<Arc<DatasetResources>> {
        self.datasets.get(dataset).map(|r| Arc::clone(r.value()))
    }

    /// The shard engine, or `ShardNotAssigned`.
    pub fn shard(&self, dataset: &str, shard: u32) -> Result<Arc<Shard>> {
        self.resources(dataset)
            .and_then(|r| r.shards.get(&shard).map(|s| Arc::clone(s.value())))
            .ok_or_else(|| MemSeriesError::ShardNotAssigned {
                dataset: dataset.to_string(),
                shard,
            })
    }

    /// Synchronously enqueues one batch into the shard's ingestion input.
    pub fn ingest(&self, dataset: &str, shard: u32, batch: RecordBatch) -> Result<()> {
        self.ensure_open()?;
        self.shard(dataset, shard)?.ingest(batch)
    }

    /// Enqueues a flush command for one group of a shard.
    pub fn flush(&self, dataset: &str, shard: u32, group: usize) -> Result<()> {
        self.ensure_open()?;
        self.shard(dataset, shard)?.flush(FlushCommand { group })
    }

    /// Subscribes a shard to the merge of a data stream and a flush-command
    /// stream. At most one subscription per (dataset, shard) may be active.
    pub fn ingest_stream(
        &self,
        dataset: &str,
        shard: u32,
        data_stream: Box<dyn IngestionStream>,
        flush_stream: Box<dyn Iterator<Item = FlushCommand> + Send>,
        ttl_seconds: u32,
    ) -> Result<IngestionHandle> {
        self.ensure_open()?;
        let resources = self
            .resources(dataset)
            .ok_or_else(|| MemSeriesError::ShardNotAssigned {
                dataset: dataset.to_string(),
                shard,
            })?;
        let engine = self.shard(dataset, shard)?;

        if resources.active_streams.insert(shard, ()).is_some() {
            return Err(MemSeriesError::IngestionAlreadyActive {
                dataset: dataset.to_string(),
                shard,
            });
        }
        engine.set_ttl_seconds(ttl_seconds);

        let stop = Arc::new(AtomicBool::new(false));
        let mut forwarders = Vec::with_capacity(2);

        {
            let engine = Arc::clone(&engine);
            let stop = Arc::clone(&stop);
            let mut data_stream = data_stream;
            forwarders.push(
                std::thread::Builder::new()
                    .name(format!("memseries-data-{shard}"))
                    .spawn(move || {
                        while !stop.load(Ordering::Acquire) {
                            match data_stream.next() {
                                Some(Ok(batch)) => {
                                    if engine.ingest(batch).is_err() {
                                        break;
                                    }
                                }
                                Some(Err(e)) => {
                                    error!(shard = engine.shard_num(), error = %e,
                                        "ingestion stream terminated with error");
                                    break;
                                }
                                None => break,
                            }
                        }
                    })
                    .expect("spawn data forwarder"),
            );
        }
        {
            let engine = Arc::clone(&engine);
            let stop = Arc::clone(&stop);
            let mut flush_stream = flush_stream;
            forwarders.push(
                std::thread::Builder::new()
                    .name(format!("memseries-flush-cmd-{shard}"))
                    .spawn(move || {
                        while !stop.load(Ordering::Acquire) {
                            match flush_stream.next() {
                                Some(command) => {
                                    if engine.flush(command).is_err() {
                                        break;
                                    }
                                }
                                None => break,
                            }
                        }
                    })
                    .expect("spawn flush forwarder"),
            );
        }

        Ok(IngestionHandle {
            shard: engine,
            resources,
            shard_num: shard,
            stop,
            forwarders,
        })
    }

    /// Installs `checkpoints` as group watermarks, then lazily replays the
    /// stream through the normal ingest path without emitting any flushes.
    /// The returned sequence reports the current offset every
    /// `report_interval` offset units and a final event at `end`.
    pub fn recover_stream(
        &self,
        dataset: &str,
        shard: u32,
        stream: Box<dyn IngestionStream>,
        start: i64,
        end: i64,
        checkpoints: &HashMap<usize, i64>,
        report_interval: i64,
    ) -> Result<RecoveryProgress> {
        self.ensure_open()?;
        let engine = self.shard(dataset, shard)?;
        engine.install_checkpoints(checkpoints);

        let done = end < start;
        Ok(RecoveryProgress {
            shard: engine,
            stream,
            start,
            end,
            report_interval: report_interval.max(1),
            next_report: start.saturating_add(report_interval.max(1)),
            done,
        })
    }

    /// Rebuilds a shard's partition-key index from persisted time buckets.
    pub fn recover_index(&self, dataset: &str, shard: u32) -> Result<()> {
        self.ensure_open()?;
        let engine = self.shard(dataset, shard)?;
        let buckets = self.column_store.scan_index_buckets(dataset, shard)?;
        let restored = buckets.len();
        for bucket in &buckets {
            engine.index().restore_bucket(bucket)?;
        }
        if let Some(max) = engine.index().max_part_id() {
            engine.reserve_part_ids(max.saturating_add(1));
        }
        info!(dataset, shard, buckets = restored, "index recovered");
        Ok(())
    }

    /// Scans the selected partitions of a shard, paging in historical chunks
    /// from the durable store when the window extends past the in-memory
    /// data. Fails with `ShardNotAssigned` when the shard is not local.
    pub fn scan_partitions(
        &self,
        dataset: &str,
        shard: u32,
        column_ids: &[u16],
        part_method: &PartitionScanMethod,
        chunk_method: &ChunkScanMethod,
    ) -> Result<PartitionScanIter> {
        self.ensure_open()?;
        let engine = self.shard(dataset, shard)?;
        let projection = Projection::new(engine.dataset().as_ref(), column_ids.to_vec())?;
        let (start, end) = chunk_method.window();

        let keys: Vec<Vec<u8>> = match part_method {
            PartitionScanMethod::All => engine
                .table()
                .values()
                .iter()
                .map(|p| p.key().to_vec())
                .collect(),
            PartitionScanMethod::ByKeys(keys) => keys.clone(),
            PartitionScanMethod::ByFilters(filters) => {
                let ids = engine.index().filter(filters, start, end, usize::MAX);
                engine.index().keys_of(&ids)
            }
        };

        Ok(PartitionScanIter {
            dataset: dataset.to_string(),
            engine,
            column_store: Arc::clone(&self.column_store),
            projection,
            start,
            end,
            keys: keys.into_iter(),
        })
    }

    /// The most frequent values for a label name, across a shard's active
    /// partitions. Empty for unknown datasets or shards.
    pub fn label_values(&self, dataset: &str, shard: u32, label: &str, top_k: usize) -> Vec<String> {
        match self.shard(dataset, shard) {
            Ok(engine) => engine.index().values_for(label, top_k),
            Err(_) => Vec::new(),
        }
    }

    /// Label values restricted to partitions matching the filters within the
    /// window.
    pub fn label_values_with_filters(
        &self,
        dataset: &str,
        shard: u32,
        label: &str,
        filters: &[ColumnFilter],
        start: i64,
        end: i64,
        top_k: usize,
    ) -> Vec<String> {
        match self.shard(dataset, shard) {
            Ok(engine) => engine
                .index()
                .values_for_filtered(label, filters, start, end, top_k),
            Err(_) => Vec::new(),
        }
    }

    /// Encoded partition keys matching the filters within the window.
    pub fn part_keys_with_filters(
        &self,
        dataset: &str,
        shard: u32,
        filters: &[ColumnFilter],
        start: i64,
        end: i64,
        limit: usize,
    ) -> Vec<Vec<u8>> {
        match self.shard(dataset, shard) {
            Ok(engine) => {
                let ids = engine.index().filter(filters, start, end, limit);
                engine.index().keys_of(&ids)
            }
            Err(_) => Vec::new(),
        }
    }

    /// Distinct label names indexed for a shard.
    pub fn index_names(&self, dataset: &str, shard: u32) -> Vec<String> {
        match self.shard(dataset, shard) {
            Ok(engine) => engine.index().label_names(),
            Err(_) => Vec::new(),
        }
    }

    fn teardown_dataset(&self, resources: &DatasetResources) {
        // Dependency order: halt ingestion, drain flushes, release buffers,
        // stop the publisher.
        resources.active_streams.clear();
        for entry in resources.shards.iter() {
            if let Err(e) = entry.value().stop() {
                error!(shard = *entry.key(), error = %e, "shard stop failed");
            }
        }
        resources.shards.clear();
        if let Err(e) = resources.publisher.stop() {
            warn!(error = %e, "downsample publisher failed to stop");
        }
    }

    /// Clears a dataset's in-memory state and its durable data.
    pub fn truncate(&self, dataset: &str) -> Result<()> {
        self.ensure_open()?;
        if let Some(resources) = self.resources(dataset) {
            for entry in resources.shards.iter() {
                entry
                    .value()
                    .release_buffers(std::time::Duration::from_secs(10))?;
            }
        }
        self.column_store.truncate(dataset)
    }

    /// Tears down every dataset and resets the durable store. The memstore
    /// stays usable; shards must be set up again.
    pub fn reset(&self) -> Result<()> {
        for entry in self.datasets.iter() {
            self.teardown_dataset(entry.value());
        }
        self.datasets.clear();
        self.column_store.reset()
    }

    /// Tears everything down and rejects further operations. Durable state
    /// is left intact; only `reset` clears the column store.
    pub fn shutdown(&self) -> Result<()> {
        if self.open.swap(false, Ordering::AcqRel) {
            for entry in self.datasets.iter() {
                self.teardown_dataset(entry.value());
            }
            self.datasets.clear();
        }
        Ok(())
    }
}

impl Drop for MemStore {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

/// A cancellable ingestion subscription.
pub struct IngestionHandle {
    shard: Arc<Shard>,
    resources: Arc<DatasetResources>,
    shard_num: u32,
    stop: Arc<AtomicBool>,
    forwarders: Vec<JoinHandle<()>>,
}

impl IngestionHandle {
    /// Stops the subscription: unsubscribes from upstream, waits for the
    /// in-flight event, drains the flush pipeline up to the shard's drain
    /// timeout, and releases pooled buffers. In-flight flushes that outlive
    /// the timeout are abandoned without advancing their watermarks.
    pub fn cancel(mut self) -> Result<()> {
        self.stop.store(true, Ordering::Release);
        for handle in self.forwarders.drain(..) {
            let _ = handle.join();
        }
        self.shard.quiesce()?;

        let drain_timeout = self.shard.config().flush_drain_timeout;
        if let Err(e) = self.shard.drain_flushes(drain_timeout) {
            warn!(shard = self.shard_num, error = %e, "flush drain timed out on cancel");
        }
        self.shard.release_buffers(drain_timeout)?;
        self.resources.active_streams.remove(&self.shard_num);
        Ok(())
    }

    /// The subscribed shard's engine, for watermark and stats inspection.
    pub fn shard(&self) -> &Arc<Shard> {
        &self.shard
    }
}

/// Lazy progress sequence of a recovery replay.
pub struct RecoveryProgress {
    shard: Arc<Shard>,
    stream: Box<dyn IngestionStream>,
    start: i64,
    end: i64,
    report_interval: i64,
    next_report: i64,
    done: bool,
}

impl Iterator for RecoveryProgress {
    type Item = RecoveryEvent;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            match self.stream.next() {
                Some(Ok(batch)) => {
                    let offset = batch.offset();
                    if offset < self.start {
                        continue;
                    }
                    if offset > self.end {
                        self.done = true;
                        let _ = self.shard.quiesce();
                        return Some(RecoveryEvent::Complete(self.end));
                    }
                    if self.shard.ingest(batch).is_err() {
                        self.done = true;
                        return Some(RecoveryEvent::Complete(self.end));
                    }
                    if offset >= self.next_report {
                        while self.next_report <= offset {
                            self.next_report =
                                self.next_report.saturating_add(self.report_interval);
                        }
                        return Some(RecoveryEvent::Progress(offset));
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, "recovery stream terminated with error");
                    self.done = true;
                    let _ = self.shard.quiesce();
                    return Some(RecoveryEvent::Complete(self.end));
                }
                None => {
                    self.done = true;
                    let _ = self.shard.quiesce();
                    return Some(RecoveryEvent::Complete(self.end));
                }
            }
        }
    }
}

/// One readable partition produced by a scan.
#[derive(Debug, Clone)]
pub struct ScannedPartition {
    pub part_key: Vec<u8>,
    pub rows: Vec<Vec<FieldValue>>,
}

/// Lazily materializes one partition per step, merging paged historical
/// chunks ahead of in-memory rows.
pub struct PartitionScanIter {
    dataset: String,
    engine: Arc<Shard>,
    column_store: Arc<dyn ColumnStore>,
    projection: Projection,
    start: i64,
    end: i64,
    keys: std::vec::IntoIter<Vec<u8>>,
}

impl PartitionScanIter {
    fn paged_rows(&self, key: &[u8], paged_end: i64) -> Vec<Vec<FieldValue>> {
        if paged_end < self.start {
            return Vec::new();
        }
        let raw = match self.column_store.read_raw_partitions(
            &self.dataset,
            self.projection.column_ids(),
            &PartitionScanMethod::ByKeys(vec![key.to_vec()]),
            &ChunkScanMethod::TimeRange {
                start: self.start,
                end: paged_end,
            },
        ) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "on-demand paging read failed");
                return Vec::new();
            }
        };

        let mut rows = Vec::new();
        for part in raw {
            for bytes in part.chunks {
                match Chunk::decode(bytes) {
                    Ok(chunk) => rows.extend(chunk.rows_in_range(
                        self.projection.column_ids(),
                        self.start,
                        paged_end,
                    )),
                    Err(e) => warn!(error = %e, "skipping undecodable paged chunk"),
                }
            }
        }
        rows
    }
}

impl Iterator for PartitionScanIter {
    type Item = ScannedPartition;

    fn next(&mut self) -> Option<Self::Item> {
        let key = self.keys.next()?;
        let partition = self.engine.table().get(&key);

        let (mem_rows, min_resident) = match &partition {
            Some(p) => (
                p.read_rows(self.projection.column_ids(), self.start, self.end),
                p.min_resident_timestamp(),
            ),
            None => (Vec::new(), None),
        };

        // Page in only what memory no longer holds.
        let paged_end = match min_resident {
            Some(min) => min.saturating_sub(1).min(self.end),
            None => self.end,
        };
        let mut rows = self.paged_rows(&key, paged_end);
        rows.extend(mem_rows);

        Some(ScannedPartition {
            part_key: key,
            rows,
        })
    }
}
