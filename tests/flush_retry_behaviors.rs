use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use memseries::columnstore::MemoryColumnStore;
use memseries::downsample::{DownsamplePublisher, RecordingPublisher};
use memseries::schema::Column;
use memseries::{ColumnKind, Dataset, FieldValue, MemStore, Record, RecordBatch, StoreConfig};

const DRAIN: Duration = Duration::from_secs(5);

fn gauge_dataset() -> Dataset {
    Dataset::new(
        "ts",
        vec![Column::new("tags", ColumnKind::Map)],
        vec![Column::new("timestamp", ColumnKind::Long)],
        vec![Column::new("value", ColumnKind::Double)],
    )
    .unwrap()
}

fn record(host: &str, ts: i64, value: f64) -> Record {
    let mut tags = BTreeMap::new();
    tags.insert("host".to_string(), host.to_string());
    Record::new(vec![
        FieldValue::Map(tags),
        FieldValue::Long(ts),
        FieldValue::Double(value),
    ])
}

fn one_group_config() -> StoreConfig {
    StoreConfig::builder()
        .with_groups_per_shard(1)
        .with_flush_retries(3)
        .with_flush_retry_backoff(Duration::from_millis(1))
        .build()
        .unwrap()
}

fn settle(store: &MemStore) {
    let engine = store.shard("ts", 0).unwrap();
    engine.quiesce().unwrap();
    engine.drain_flushes(DRAIN).unwrap();
}

#[test]
fn transient_store_failures_retry_until_the_watermark_advances_once() {
    let column_store = Arc::new(MemoryColumnStore::new());
    let store = MemStore::new(column_store.clone());
    store
        .setup(gauge_dataset(), 0, one_group_config(), None)
        .unwrap();

    store
        .ingest("ts", 0, RecordBatch::new(vec![record("a", 1, 1.0)], 0))
        .unwrap();
    column_store.fail_next_writes(2, true);
    store.flush("ts", 0, 0).unwrap();
    settle(&store);

    let engine = store.shard("ts", 0).unwrap();
    assert_eq!(engine.watermark(0), 0);
    assert_eq!(engine.stats().flushes_completed, 1);
    assert_eq!(engine.stats().flushes_failed, 0);
    // Retries re-wrote the same flush address; no duplicate chunks.
    assert_eq!(column_store.persisted_rows("ts", 0), 1);

    store.shutdown().unwrap();
}

#[test]
fn permanent_failure_leaves_the_watermark_for_the_next_cycle() {
    let column_store = Arc::new(MemoryColumnStore::new());
    let store = MemStore::new(column_store.clone());
    store
        .setup(gauge_dataset(), 0, one_group_config(), None)
        .unwrap();

    store
        .ingest("ts", 0, RecordBatch::new(vec![record("a", 1, 1.0)], 0))
        .unwrap();
    column_store.fail_next_writes(10, false);
    store.flush("ts", 0, 0).unwrap();
    settle(&store);

    let engine = store.shard("ts", 0).unwrap();
    assert_eq!(engine.watermark(0), -1);
    assert_eq!(engine.stats().flushes_failed, 1);
    assert_eq!(column_store.persisted_rows("ts", 0), 0);

    // The next flush cycle re-snapshots the unflushed state and commits.
    column_store.fail_next_writes(0, false);
    store.flush("ts", 0, 0).unwrap();
    settle(&store);

    assert_eq!(engine.watermark(0), 0);
    assert_eq!(column_store.persisted_rows("ts", 0), 1);

    store.shutdown().unwrap();
}

#[test]
fn reflushing_an_already_persisted_group_adds_no_rows() {
    let column_store = Arc::new(MemoryColumnStore::new());
    let store = MemStore::new(column_store.clone());
    store
        .setup(gauge_dataset(), 0, one_group_config(), None)
        .unwrap();

    store
        .ingest(
            "ts",
            0,
            RecordBatch::new(vec![record("a", 1, 1.0), record("a", 2, 2.0)], 0),
        )
        .unwrap();
    store.flush("ts", 0, 0).unwrap();
    settle(&store);
    assert_eq!(column_store.persisted_rows("ts", 0), 2);

    // Same offset, no new data: the repeat flush is a no-op on durable rows.
    store.flush("ts", 0, 0).unwrap();
    settle(&store);

    let engine = store.shard("ts", 0).unwrap();
    assert_eq!(engine.watermark(0), 0);
    assert_eq!(column_store.persisted_rows("ts", 0), 2);

    store.shutdown().unwrap();
}

#[test]
fn committed_chunks_are_published_downsampled() {
    let column_store = Arc::new(MemoryColumnStore::new());
    let publisher = Arc::new(RecordingPublisher::new());
    let store = MemStore::new(column_store);
    store
        .setup(
            gauge_dataset(),
            0,
            one_group_config(),
            Some(publisher.clone() as Arc<dyn DownsamplePublisher>),
        )
        .unwrap();

    store
        .ingest(
            "ts",
            0,
            RecordBatch::new(vec![record("a", 1, 2.0), record("a", 2, 4.0)], 0),
        )
        .unwrap();
    store.flush("ts", 0, 0).unwrap();
    settle(&store);

    let records = publisher.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].start, 1);
    assert_eq!(records[0].end, 2);
    let agg = &records[0].aggregates[0];
    assert_eq!(agg.min, 2.0);
    assert_eq!(agg.max, 4.0);
    assert_eq!(agg.sum, 6.0);
    assert_eq!(agg.count, 2);

    store.shutdown().unwrap();
}

#[test]
fn watermarks_advance_monotonically_across_flush_cycles() {
    let column_store = Arc::new(MemoryColumnStore::new());
    let store = MemStore::new(column_store);
    store
        .setup(gauge_dataset(), 0, one_group_config(), None)
        .unwrap();
    let engine = store.shard("ts", 0).unwrap();

    let mut seen = Vec::new();
    for offset in 0..5i64 {
        store
            .ingest(
                "ts",
                0,
                RecordBatch::new(vec![record("a", offset + 1, 1.0)], offset),
            )
            .unwrap();
        store.flush("ts", 0, 0).unwrap();
        settle(&store);
        seen.push(engine.watermark(0));
    }

    assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    store.shutdown().unwrap();
}
