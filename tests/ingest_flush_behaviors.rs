use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use memseries::columnstore::{ChunkScanMethod, MemoryColumnStore, PartitionScanMethod};
use memseries::partkey::{encode_partition_key, hash_key};
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

fn group_of(host: &str, groups: usize) -> usize {
    let key = encode_partition_key(&gauge_dataset(), &record(host, 0, 0.0)).unwrap();
    (hash_key(&key) % groups as u64) as usize
}

/// A host name whose partition key lands in the requested group.
fn host_in_group(target: usize, groups: usize) -> String {
    for i in 0..1000u32 {
        let host = format!("host-{i}");
        if group_of(&host, groups) == target {
            return host;
        }
    }
    unreachable!("some host lands in every group");
}

fn setup(config: StoreConfig) -> (MemStore, Arc<MemoryColumnStore>) {
    let column_store = Arc::new(MemoryColumnStore::new());
    let store = MemStore::new(column_store.clone());
    store.setup(gauge_dataset(), 0, config, None).unwrap();
    (store, column_store)
}

fn settle(store: &MemStore) {
    let engine = store.shard("ts", 0).unwrap();
    engine.quiesce().unwrap();
    engine.drain_flushes(DRAIN).unwrap();
}

#[test]
fn single_series_round_trip() {
    let config = StoreConfig::builder()
        .with_groups_per_shard(1)
        .build()
        .unwrap();
    let (store, column_store) = setup(config);

    store
        .ingest("ts", 0, RecordBatch::new(vec![record("a", 1, 1.0)], 0))
        .unwrap();
    store
        .ingest("ts", 0, RecordBatch::new(vec![record("a", 2, 2.0)], 1))
        .unwrap();
    store.flush("ts", 0, 0).unwrap();
    settle(&store);

    let engine = store.shard("ts", 0).unwrap();
    assert_eq!(engine.watermarks(), vec![1]);

    let sets = column_store.chunk_sets("ts", 0);
    assert_eq!(sets.len(), 1);
    assert_eq!(sets[0].0, 0);
    assert_eq!(sets[0].1, 1);
    assert_eq!(column_store.persisted_rows("ts", 0), 2);

    let scanned: Vec<_> = store
        .scan_partitions(
            "ts",
            0,
            &[0, 1],
            &PartitionScanMethod::All,
            &ChunkScanMethod::TimeRange { start: 1, end: 2 },
        )
        .unwrap()
        .collect();
    assert_eq!(scanned.len(), 1);
    assert_eq!(
        scanned[0].rows,
        vec![
            vec![FieldValue::Long(1), FieldValue::Double(1.0)],
            vec![FieldValue::Long(2), FieldValue::Double(2.0)],
        ]
    );

    store.shutdown().unwrap();
}

#[test]
fn two_group_split_persists_only_the_flushed_group() {
    let config = StoreConfig::builder()
        .with_groups_per_shard(2)
        .build()
        .unwrap();
    let (store, column_store) = setup(config);

    let host0 = host_in_group(0, 2);
    let host1 = host_in_group(1, 2);

    for (offset, host) in [&host0, &host1, &host0, &host1].iter().enumerate() {
        store
            .ingest(
                "ts",
                0,
                RecordBatch::new(
                    vec![record(host, offset as i64 + 1, 1.0)],
                    offset as i64,
                ),
            )
            .unwrap();
    }
    store.flush("ts", 0, 0).unwrap();
    settle(&store);

    let engine = store.shard("ts", 0).unwrap();
    assert_eq!(engine.watermarks(), vec![3, -1]);
    // Only group 0's two rows are durable.
    assert_eq!(column_store.persisted_rows("ts", 0), 2);

    store.shutdown().unwrap();
}

#[test]
fn records_are_visible_to_scans_before_any_flush() {
    let (store, _column_store) = setup(StoreConfig::default());

    store
        .ingest(
            "ts",
            0,
            RecordBatch::new(vec![record("a", 1, 1.0), record("a", 2, 2.0)], 0),
        )
        .unwrap();
    store.shard("ts", 0).unwrap().quiesce().unwrap();

    let scanned: Vec<_> = store
        .scan_partitions(
            "ts",
            0,
            &[0, 1],
            &PartitionScanMethod::All,
            &ChunkScanMethod::All,
        )
        .unwrap()
        .collect();
    assert_eq!(scanned.len(), 1);
    assert_eq!(scanned[0].rows.len(), 2);

    store.shutdown().unwrap();
}

#[test]
fn same_key_rows_scan_in_ingest_order_across_rotations() {
    let config = StoreConfig::builder().with_max_chunks_size(3).build().unwrap();
    let (store, _column_store) = setup(config);

    for ts in 1..=10 {
        store
            .ingest(
                "ts",
                0,
                RecordBatch::new(vec![record("a", ts, ts as f64)], ts - 1),
            )
            .unwrap();
    }
    store.shard("ts", 0).unwrap().quiesce().unwrap();

    let scanned: Vec<_> = store
        .scan_partitions(
            "ts",
            0,
            &[0],
            &PartitionScanMethod::All,
            &ChunkScanMethod::All,
        )
        .unwrap()
        .collect();
    let timestamps: Vec<i64> = scanned[0]
        .rows
        .iter()
        .map(|row| match row[0] {
            FieldValue::Long(ts) => ts,
            _ => panic!("timestamp column must be Long"),
        })
        .collect();
    assert_eq!(timestamps, (1..=10).collect::<Vec<i64>>());

    store.shutdown().unwrap();
}

#[test]
fn empty_group_flush_still_advances_the_watermark() {
    let config = StoreConfig::builder()
        .with_groups_per_shard(2)
        .build()
        .unwrap();
    let (store, column_store) = setup(config);

    let host0 = host_in_group(0, 2);
    store
        .ingest("ts", 0, RecordBatch::new(vec![record(&host0, 1, 1.0)], 4))
        .unwrap();
    // Group 1 holds no partitions, yet its flush is a no-op task that still
    // acks the watermark.
    store.flush("ts", 0, 1).unwrap();
    settle(&store);

    let engine = store.shard("ts", 0).unwrap();
    assert_eq!(engine.watermark(1), 4);
    assert_eq!(column_store.persisted_rows("ts", 0), 0);

    store.shutdown().unwrap();
}

#[test]
fn flush_commands_exclude_records_ingested_afterwards() {
    let config = StoreConfig::builder()
        .with_groups_per_shard(1)
        .build()
        .unwrap();
    let (store, column_store) = setup(config);

    store
        .ingest("ts", 0, RecordBatch::new(vec![record("a", 1, 1.0)], 0))
        .unwrap();
    store.flush("ts", 0, 0).unwrap();
    store
        .ingest("ts", 0, RecordBatch::new(vec![record("a", 2, 2.0)], 1))
        .unwrap();
    settle(&store);

    // Only the pre-flush record is durable; the watermark stays at the
    // offset observed when the command was processed.
    assert_eq!(column_store.persisted_rows("ts", 0), 1);
    let engine = store.shard("ts", 0).unwrap();
    assert_eq!(engine.watermark(0), 0);

    store.shutdown().unwrap();
}

#[test]
fn label_lookups_reflect_active_partitions() {
    let (store, _column_store) = setup(StoreConfig::default());

    for (i, host) in ["a", "a", "b"].iter().enumerate() {
        store
            .ingest(
                "ts",
                0,
                RecordBatch::new(vec![record(host, i as i64 + 1, 1.0)], i as i64),
            )
            .unwrap();
    }
    store.shard("ts", 0).unwrap().quiesce().unwrap();

    assert_eq!(store.index_names("ts", 0), vec!["host".to_string()]);
    assert_eq!(store.label_values("ts", 0, "host", 10), vec!["a", "b"]);
    assert!(store.label_values("ts", 9, "host", 10).is_empty());

    let keys = store.part_keys_with_filters(
        "ts",
        0,
        &[memseries::index::ColumnFilter::equals("host", "b")],
        0,
        100,
        10,
    );
    assert_eq!(keys.len(), 1);

    store.shutdown().unwrap();
}

#[test]
fn unknown_shards_surface_or_stay_empty_per_operation() {
    let (store, _column_store) = setup(StoreConfig::default());

    let err = store
        .ingest("ts", 7, RecordBatch::new(vec![record("a", 1, 1.0)], 0))
        .unwrap_err();
    assert!(matches!(
        err,
        memseries::MemSeriesError::ShardNotAssigned { shard: 7, .. }
    ));

    let err = store
        .scan_partitions(
            "ts",
            7,
            &[0],
            &PartitionScanMethod::All,
            &ChunkScanMethod::All,
        )
        .map(|_| ())
        .unwrap_err();
    assert!(matches!(
        err,
        memseries::MemSeriesError::ShardNotAssigned { shard: 7, .. }
    ));

    assert!(store.label_values("ts", 7, "host", 10).is_empty());

    store.shutdown().unwrap();
}

#[test]
fn setup_rejects_duplicate_shards() {
    let (store, _column_store) = setup(StoreConfig::default());
    let err = store
        .setup(gauge_dataset(), 0, StoreConfig::default(), None)
        .unwrap_err();
    assert!(matches!(
        err,
        memseries::MemSeriesError::ShardAlreadySetup { shard: 0, .. }
    ));
    store.shutdown().unwrap();
}
