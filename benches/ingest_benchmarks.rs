use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use memseries::columnstore::MemoryColumnStore;
use memseries::schema::Column;
use memseries::{ColumnKind, Dataset, FieldValue, MemStore, Record, RecordBatch, StoreConfig};

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

fn bench_ingest(c: &mut Criterion) {
    let mut group = c.benchmark_group("ingest");
    for &series in &[1usize, 16, 256] {
        group.throughput(Throughput::Elements(1000));
        group.bench_with_input(
            BenchmarkId::from_parameter(series),
            &series,
            |b, &series| {
                let store = MemStore::new(Arc::new(MemoryColumnStore::new()));
                store
                    .setup(gauge_dataset(), 0, StoreConfig::default(), None)
                    .unwrap();
                let engine = store.shard("ts", 0).unwrap();

                let mut ts = 0i64;
                b.iter(|| {
                    let records: Vec<Record> = (0..1000)
                        .map(|i| {
                            ts += 1;
                            record(&format!("host-{}", i % series), ts, i as f64)
                        })
                        .collect();
                    store
                        .ingest("ts", 0, RecordBatch::new(records, ts))
                        .unwrap();
                    engine.quiesce().unwrap();
                });

                store.shutdown().unwrap();
            },
        );
    }
    group.finish();
}

fn bench_flush_cycle(c: &mut Criterion) {
    c.bench_function("flush_cycle", |b| {
        let store = MemStore::new(Arc::new(MemoryColumnStore::new()));
        let config = StoreConfig::builder().with_groups_per_shard(1).build().unwrap();
        store.setup(gauge_dataset(), 0, config, None).unwrap();
        let engine = store.shard("ts", 0).unwrap();

        let mut ts = 0i64;
        b.iter(|| {
            let records: Vec<Record> = (0..100)
                .map(|i| {
                    ts += 1;
                    record(&format!("host-{}", i % 8), ts, i as f64)
                })
                .collect();
            store.ingest("ts", 0, RecordBatch::new(records, ts)).unwrap();
            store.flush("ts", 0, 0).unwrap();
            engine.quiesce().unwrap();
            engine.drain_flushes(Duration::from_secs(5)).unwrap();
        });

        store.shutdown().unwrap();
    });
}

criterion_group!(benches, bench_ingest, bench_flush_cycle);
criterion_main!(benches);
