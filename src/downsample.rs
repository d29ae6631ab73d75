//! Downsample publishing.
//!
//! Flush tasks reduce each persisted chunk to one summary record per
//! partition and hand them to an opaque publisher. The publisher is started
//! and stopped by the memstore; `publish` is called from flush threads.

use crate::chunk::Chunk;
use crate::error::Result;
use parking_lot::Mutex;

/// Per-column aggregate of one downsampled chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnAggregate {
    pub min: f64,
    pub max: f64,
    pub sum: f64,
    pub count: u64,
}

/// Summary of one persisted chunk for a partition.
#[derive(Debug, Clone)]
pub struct DownsampleRecord {
    pub part_key: Vec<u8>,
    pub start: i64,
    pub end: i64,
    pub aggregates: Vec<ColumnAggregate>,
}

/// Reduces a chunk to one downsample record. Aggregates cover the non-key
/// chunk columns in column order.
pub fn downsample_chunk(part_key: &[u8], chunk: &Chunk) -> DownsampleRecord {
    let mut aggregates = vec![
        ColumnAggregate {
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            sum: 0.0,
            count: 0,
        };
        chunk.num_columns().saturating_sub(1)
    ];

    for row in 0..chunk.row_count() {
        for (col, agg) in aggregates.iter_mut().enumerate() {
            let value = match chunk.value_at(col + 1, row) {
                crate::FieldValue::Double(v) => v,
                crate::FieldValue::Long(v) => v as f64,
                _ => continue,
            };
            if value.is_nan() {
                continue;
            }
            agg.min = agg.min.min(value);
            agg.max = agg.max.max(value);
            agg.sum += value;
            agg.count += 1;
        }
    }

    DownsampleRecord {
        part_key: part_key.to_vec(),
        start: chunk.min_timestamp(),
        end: chunk.max_timestamp(),
        aggregates,
    }
}

/// Sink for downsampled records.
pub trait DownsamplePublisher: Send + Sync {
    fn start(&self) -> Result<()>;
    fn publish(&self, records: &[DownsampleRecord]) -> Result<()>;
    fn stop(&self) -> Result<()>;
}

/// Publisher that discards everything.
pub struct NopPublisher;

impl DownsamplePublisher for NopPublisher {
    fn start(&self) -> Result<()> {
        Ok(())
    }

    fn publish(&self, _records: &[DownsampleRecord]) -> Result<()> {
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        Ok(())
    }
}

/// Publisher that retains records in memory for assertions.
#[derive(Default)]
pub struct RecordingPublisher {
    records: Mutex<Vec<DownsampleRecord>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<DownsampleRecord> {
        self.records.lock().clone()
    }
}

impl DownsamplePublisher for RecordingPublisher {
    fn start(&self) -> Result<()> {
        Ok(())
    }

    fn publish(&self, records: &[DownsampleRecord]) -> Result<()> {
        self.records.lock().extend_from_slice(records);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkBuilder;
    use crate::pool::BufferPool;
    use crate::schema::{Column, ColumnKind, Dataset};
    use crate::FieldValue;

    #[test]
    fn downsample_aggregates_each_data_column() {
        let dataset = Dataset::new(
            "ts",
            vec![Column::new("tags", ColumnKind::Map)],
            vec![Column::new("timestamp", ColumnKind::Long)],
            vec![Column::new("value", ColumnKind::Double)],
        )
        .unwrap();
        let pool = BufferPool::new(1024 * 1024, "test");
        let mut builder = ChunkBuilder::new(&dataset, &pool, 4).unwrap();
        for (ts, v) in [(1, 1.0), (2, 3.0), (3, 2.0)] {
            builder
                .append(&[FieldValue::Long(ts), FieldValue::Double(v)])
                .unwrap();
        }
        let chunk = builder.freeze().unwrap();

        let record = downsample_chunk(b"key", &chunk);
        assert_eq!(record.start, 1);
        assert_eq!(record.end, 3);
        assert_eq!(record.aggregates.len(), 1);
        let agg = &record.aggregates[0];
        assert_eq!(agg.min, 1.0);
        assert_eq!(agg.max, 3.0);
        assert_eq!(agg.sum, 6.0);
        assert_eq!(agg.count, 3);
    }
}
