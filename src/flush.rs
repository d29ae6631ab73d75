//! Flush pipeline.
//!
//! Consumes flush tasks from a bounded queue and commits them to the column
//! store on a pool of worker threads. Tasks for different groups commit out
//! of order; tasks for the same group serialize on a per-group lock. A
//! group's watermark advances only after its chunk sets and index bucket are
//! durably written.

use crate::columnstore::{ColumnStore, PartChunkSet};
use crate::downsample::{downsample_chunk, DownsamplePublisher, DownsampleRecord};
use crate::error::{MemSeriesError, Result};
use crate::partition::{ChunkSlot, Partition};
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// One partition's contribution to a flush task.
pub struct FlushPart {
    pub partition: Arc<Partition>,
    pub slots: Vec<Arc<ChunkSlot>>,
}

/// A flush unit: everything group `group` owes the durable store as of
/// `offset`.
pub struct FlushGroup {
    pub dataset: String,
    pub shard: u32,
    pub group: usize,
    pub offset: i64,
    pub ttl_seconds: u32,
    pub bucket: Vec<u8>,
    pub parts: Vec<FlushPart>,
}

enum Message {
    Task(FlushGroup),
    Shutdown,
}

struct PipelineShared {
    column_store: Arc<dyn ColumnStore>,
    publisher: Arc<dyn DownsamplePublisher>,
    watermarks: Arc<Vec<AtomicI64>>,
    group_locks: Vec<Mutex<()>>,
    in_flight: AtomicUsize,
    flushes_completed: AtomicU64,
    flushes_failed: AtomicU64,
    shutdown: AtomicBool,
    retries: usize,
    retry_backoff: Duration,
}

/// Bounded worker pool committing flush tasks to the column store.
pub struct FlushPipeline {
    shared: Arc<PipelineShared>,
    sender: Sender<Message>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl FlushPipeline {
    pub fn new(
        shard: u32,
        groups: usize,
        parallelism: usize,
        retries: usize,
        retry_backoff: Duration,
        column_store: Arc<dyn ColumnStore>,
        publisher: Arc<dyn DownsamplePublisher>,
        watermarks: Arc<Vec<AtomicI64>>,
    ) -> Self {
        let shared = Arc::new(PipelineShared {
            column_store,
            publisher,
            watermarks,
            group_locks: (0..groups).map(|_| Mutex::new(())).collect(),
            in_flight: AtomicUsize::new(0),
            flushes_completed: AtomicU64::new(0),
            flushes_failed: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            retries,
            retry_backoff,
        });

        let queue_capacity = parallelism.saturating_mul(2).max(1);
        let (sender, receiver) = bounded::<Message>(queue_capacity);

        let mut workers = Vec::with_capacity(parallelism);
        for id in 0..parallelism {
            let receiver: Receiver<Message> = receiver.clone();
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("memseries-flush-{shard}-{id}"))
                .spawn(move || {
                    loop {
                        let message = match receiver.recv() {
                            Ok(msg) => msg,
                            Err(_) => break,
                        };
                        match message {
                            Message::Task(task) => {
                                run_task(&shared, task);
                                shared.in_flight.fetch_sub(1, Ordering::AcqRel);
                            }
                            Message::Shutdown => break,
                        }
                    }
                })
                .expect("spawn flush worker");
            workers.push(handle);
        }

        Self {
            shared,
            sender,
            workers: Mutex::new(workers),
        }
    }

    /// Enqueues a flush task. Blocks when the queue is full, back-pressuring
    /// the ingestion thread.
    pub fn submit(&self, task: FlushGroup) -> Result<()> {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(MemSeriesError::ShuttingDown);
        }
        self.shared.in_flight.fetch_add(1, Ordering::AcqRel);
        self.sender.send(Message::Task(task)).map_err(|_| {
            self.shared.in_flight.fetch_sub(1, Ordering::AcqRel);
            MemSeriesError::ChannelSend {
                channel: "flush_pipeline".to_string(),
            }
        })?;
        Ok(())
    }

    /// Tasks queued or currently running.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::Acquire)
    }

    pub fn flushes_completed(&self) -> u64 {
        self.shared.flushes_completed.load(Ordering::Acquire)
    }

    pub fn flushes_failed(&self) -> u64 {
        self.shared.flushes_failed.load(Ordering::Acquire)
    }

    /// Waits for all in-flight tasks to finish. On timeout the tasks keep
    /// running but the caller stops waiting for them.
    pub fn drain(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        while self.in_flight() > 0 {
            if Instant::now() >= deadline {
                return Err(MemSeriesError::FlushDrainTimeout {
                    timeout_ms: timeout.as_millis() as u64,
                    pending: self.in_flight(),
                });
            }
            thread::sleep(Duration::from_millis(5));
        }
        Ok(())
    }

    /// Stops accepting tasks and detaches the workers without waiting for
    /// in-flight tasks. Used when a drain deadline has already expired.
    pub fn abandon(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        let mut workers = self.workers.lock();
        for _ in workers.iter() {
            let _ = self.sender.try_send(Message::Shutdown);
        }
        workers.clear();
    }

    /// Stops accepting tasks and joins the workers after the queue empties.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut workers = self.workers.lock();
        for _ in workers.iter() {
            let _ = self.sender.send(Message::Shutdown);
        }
        for handle in workers.drain(..) {
            if handle.join().is_err() {
                error!("flush worker panicked during shutdown");
            }
        }
    }
}

impl Drop for FlushPipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_task(shared: &PipelineShared, task: FlushGroup) {
    let _group_guard = shared.group_locks[task.group].lock();

    match commit(shared, &task) {
        Ok(()) => {
            advance_watermark(&shared.watermarks[task.group], task.offset);
            let mut downsampled: Vec<DownsampleRecord> = Vec::new();
            for part in &task.parts {
                for slot in &part.slots {
                    slot.mark_persisted();
                    downsampled.push(downsample_chunk(part.partition.key(), slot.chunk()));
                }
                part.partition.end_flush();
            }
            if !downsampled.is_empty() {
                if let Err(e) = shared.publisher.publish(&downsampled) {
                    warn!(group = task.group, error = %e, "downsample publish failed");
                }
            }
            shared.flushes_completed.fetch_add(1, Ordering::AcqRel);
            debug!(
                shard = task.shard,
                group = task.group,
                offset = task.offset,
                parts = task.parts.len(),
                "flush committed"
            );
        }
        Err(e) => {
            // Leave the watermark alone; the group re-snapshots on its next
            // flush and the durable writes are idempotent by address.
            for part in &task.parts {
                part.partition.end_flush();
            }
            shared.flushes_failed.fetch_add(1, Ordering::AcqRel);
            error!(
                shard = task.shard,
                group = task.group,
                offset = task.offset,
                error = %e,
                "flush failed; watermark unchanged"
            );
        }
    }
}

fn commit(shared: &PipelineShared, task: &FlushGroup) -> Result<()> {
    let chunk_sets: Vec<PartChunkSet> = task
        .parts
        .iter()
        .map(|part| PartChunkSet {
            part_key: part.partition.key().to_vec(),
            chunks: part.slots.iter().map(|s| s.chunk().bytes()).collect(),
        })
        .collect();

    with_retries(shared, || {
        if !chunk_sets.is_empty() {
            shared.column_store.write_chunks(
                &task.dataset,
                task.shard,
                task.group,
                task.offset,
                &chunk_sets,
                task.ttl_seconds,
            )?;
        }
        shared.column_store.write_index_time_bucket(
            &task.dataset,
            task.shard,
            task.group,
            task.offset,
            &task.bucket,
        )
    })
}

fn with_retries<F>(shared: &PipelineShared, mut op: F) -> Result<()>
where
    F: FnMut() -> Result<()>,
{
    let mut attempt = 0usize;
    loop {
        match op() {
            Ok(()) => return Ok(()),
            Err(e) if e.is_transient() && attempt < shared.retries => {
                let backoff = shared.retry_backoff * (1u32 << attempt.min(16)) as u32;
                info!(attempt, backoff_ms = backoff.as_millis() as u64, error = %e,
                    "transient flush failure, retrying");
                thread::sleep(backoff);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

fn advance_watermark(watermark: &AtomicI64, offset: i64) {
    let mut current = watermark.load(Ordering::Acquire);
    while offset > current {
        match watermark.compare_exchange_weak(
            current,
            offset,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => break,
            Err(now) => current = now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::columnstore::MemoryColumnStore;
    use crate::downsample::NopPublisher;
    use crate::pool::BufferPool;
    use crate::schema::{Column, ColumnKind, Dataset};
    use crate::FieldValue;

    fn gauge_dataset() -> Dataset {
        Dataset::new(
            "ts",
            vec![Column::new("tags", ColumnKind::Map)],
            vec![Column::new("timestamp", ColumnKind::Long)],
            vec![Column::new("value", ColumnKind::Double)],
        )
        .unwrap()
    }

    fn flush_part(pool: &BufferPool, dataset: &Dataset) -> FlushPart {
        let partition = Arc::new(Partition::new(0, 0, b"key", 1, pool, 8, 4, 0).unwrap());
        partition
            .ingest(
                dataset,
                pool,
                &[FieldValue::Long(1), FieldValue::Double(1.0)],
                0,
                1,
            )
            .unwrap();
        let slots = partition.switch_buffers();
        FlushPart { partition, slots }
    }

    fn pipeline(
        store: Arc<MemoryColumnStore>,
        watermarks: Arc<Vec<AtomicI64>>,
        retries: usize,
    ) -> FlushPipeline {
        FlushPipeline::new(
            0,
            1,
            1,
            retries,
            Duration::from_millis(1),
            store,
            Arc::new(NopPublisher),
            watermarks,
        )
    }

    fn task(pool: &BufferPool, dataset: &Dataset, offset: i64) -> FlushGroup {
        FlushGroup {
            dataset: "ts".to_string(),
            shard: 0,
            group: 0,
            offset,
            ttl_seconds: 60,
            bucket: vec![1, 2, 3],
            parts: vec![flush_part(pool, dataset)],
        }
    }

    #[test]
    fn successful_flush_advances_the_watermark() {
        let store = Arc::new(MemoryColumnStore::new());
        let watermarks = Arc::new(vec![AtomicI64::new(-1)]);
        let pipeline = pipeline(Arc::clone(&store), Arc::clone(&watermarks), 0);
        let pool = BufferPool::new(1024 * 1024, "test");
        let dataset = gauge_dataset();

        pipeline.submit(task(&pool, &dataset, 7)).unwrap();
        pipeline.drain(Duration::from_secs(5)).unwrap();

        assert_eq!(watermarks[0].load(Ordering::Acquire), 7);
        assert_eq!(store.persisted_rows("ts", 0), 1);
        assert_eq!(pipeline.flushes_completed(), 1);
    }

    #[test]
    fn transient_failures_retry_and_commit_once() {
        let store = Arc::new(MemoryColumnStore::new());
        let watermarks = Arc::new(vec![AtomicI64::new(-1)]);
        let pipeline = pipeline(Arc::clone(&store), Arc::clone(&watermarks), 3);
        let pool = BufferPool::new(1024 * 1024, "test");
        let dataset = gauge_dataset();

        store.fail_next_writes(2, true);
        pipeline.submit(task(&pool, &dataset, 3)).unwrap();
        pipeline.drain(Duration::from_secs(5)).unwrap();

        assert_eq!(watermarks[0].load(Ordering::Acquire), 3);
        assert_eq!(store.persisted_rows("ts", 0), 1);
        assert_eq!(pipeline.flushes_failed(), 0);
    }

    #[test]
    fn permanent_failure_leaves_watermark_unchanged() {
        let store = Arc::new(MemoryColumnStore::new());
        let watermarks = Arc::new(vec![AtomicI64::new(-1)]);
        let pipeline = pipeline(Arc::clone(&store), Arc::clone(&watermarks), 3);
        let pool = BufferPool::new(1024 * 1024, "test");
        let dataset = gauge_dataset();

        store.fail_next_writes(1, false);
        pipeline.submit(task(&pool, &dataset, 3)).unwrap();
        pipeline.drain(Duration::from_secs(5)).unwrap();

        assert_eq!(watermarks[0].load(Ordering::Acquire), -1);
        assert_eq!(pipeline.flushes_failed(), 1);
    }

    #[test]
    fn empty_flush_still_advances_the_watermark() {
        let store = Arc::new(MemoryColumnStore::new());
        let watermarks = Arc::new(vec![AtomicI64::new(-1)]);
        let pipeline = pipeline(Arc::clone(&store), Arc::clone(&watermarks), 0);

        pipeline
            .submit(FlushGroup {
                dataset: "ts".to_string(),
                shard: 0,
                group: 0,
                offset: 11,
                ttl_seconds: 60,
                bucket: Vec::new(),
                parts: Vec::new(),
            })
            .unwrap();
        pipeline.drain(Duration::from_secs(5)).unwrap();

        assert_eq!(watermarks[0].load(Ordering::Acquire), 11);
        assert_eq!(store.persisted_rows("ts", 0), 0);
    }
}
