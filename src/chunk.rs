//! Chunk building and the immutable columnar chunk format.
//!
//! A chunk is a bounded run of rows for one partition: row-key columns first,
//! then data columns, each encoded as 8-byte cells. The frozen layout is
//! self-describing and length-prefixed so it can round-trip through the
//! durable column store without touching the buffer pool.

use crate::error::{MemSeriesError, Result};
use crate::pool::{BufferPool, PoolBuffer};
use crate::schema::{ColumnKind, Dataset};
use crate::FieldValue;
use bytes::Bytes;
use std::ops::Range;

const CELL_BYTES: usize = 8;

/// Per-column append buffer backed by the pool.
struct ColumnAppender {
    kind: ColumnKind,
    buf: PoolBuffer,
}

/// Builds one chunk by appending rows into pooled per-column buffers.
pub struct ChunkBuilder {
    columns: Vec<ColumnAppender>,
    max_rows: usize,
    row_count: usize,
    min_ts: i64,
    max_ts: i64,
}

impl ChunkBuilder {
    /// Allocates append buffers for every chunk column of the dataset.
    /// Fails with `BufferPoolExhausted` when the pool cannot cover them.
    pub fn new(dataset: &Dataset, pool: &BufferPool, max_rows: usize) -> Result<Self> {
        let mut columns = Vec::with_capacity(dataset.num_chunk_columns());
        for column in dataset.chunk_columns() {
            let buf = pool.allocate(max_rows * CELL_BYTES)?;
            columns.push(ColumnAppender {
                kind: column.kind,
                buf,
            });
        }
        Ok(Self {
            columns,
            max_rows,
            row_count: 0,
            min_ts: i64::MAX,
            max_ts: i64::MIN,
        })
    }

    /// Appends one row. `values` are the record's chunk-column values in
    /// column order; the first is the row-key timestamp.
    pub fn append(&mut self, values: &[FieldValue]) -> Result<()> {
        if self.row_count >= self.max_rows {
            return Err(MemSeriesError::ChunkFull {
                rows: self.row_count,
            });
        }
        debug_assert_eq!(values.len(), self.columns.len());

        let offset = self.row_count * CELL_BYTES;
        for (appender, value) in self.columns.iter_mut().zip(values.iter()) {
            let cell: [u8; 8] = match (appender.kind, value) {
                (ColumnKind::Long, FieldValue::Long(v)) => v.to_le_bytes(),
                (ColumnKind::Double, FieldValue::Double(v)) => v.to_bits().to_le_bytes(),
                _ => {
                    return Err(MemSeriesError::BadSchema(format!(
                        "chunk value {value} does not match column kind {:?}",
                        appender.kind
                    )));
                }
            };
            appender.buf[offset..offset + CELL_BYTES].copy_from_slice(&cell);
        }

        let ts = match values[0] {
            FieldValue::Long(ts) => ts,
            _ => unreachable!("first chunk column is the Long row key"),
        };
        self.min_ts = self.min_ts.min(ts);
        self.max_ts = self.max_ts.max(ts);
        self.row_count += 1;
        Ok(())
    }

    /// Rows appended so far.
    pub fn row_count(&self) -> usize {
        self.row_count
    }

    /// True once the builder has reached its row cap.
    pub fn is_full(&self) -> bool {
        self.row_count >= self.max_rows
    }

    /// Smallest row-key timestamp appended, if any row was.
    pub fn min_timestamp(&self) -> Option<i64> {
        (self.row_count > 0).then_some(self.min_ts)
    }

    /// Largest row-key timestamp appended, if any row was.
    pub fn max_timestamp(&self) -> Option<i64> {
        (self.row_count > 0).then_some(self.max_ts)
    }

    fn value_at(&self, col: usize, row: usize) -> FieldValue {
        let appender = &self.columns[col];
        let at = row * CELL_BYTES;
        let raw: [u8; 8] = appender.buf[at..at + CELL_BYTES]
            .try_into()
            .expect("cell is 8 bytes");
        match appender.kind {
            ColumnKind::Double => FieldValue::Double(f64::from_bits(u64::from_le_bytes(raw))),
            _ => FieldValue::Long(i64::from_le_bytes(raw)),
        }
    }

    /// Materializes the selected columns of appended rows whose timestamp
    /// lies in `[start, end]`. Lets readers see rows not yet frozen.
    pub fn rows_in_range(
        &self,
        column_ids: &[u16],
        start: i64,
        end: i64,
    ) -> Vec<Vec<FieldValue>> {
        let mut rows = Vec::new();
        for row in 0..self.row_count {
            let ts = match self.value_at(0, row) {
                FieldValue::Long(ts) => ts,
                _ => unreachable!("first chunk column is the Long row key"),
            };
            if ts < start || ts > end {
                continue;
            }
            rows.push(
                column_ids
                    .iter()
                    .map(|&col| self.value_at(col as usize, row))
                    .collect(),
            );
        }
        rows
    }

    /// Encodes the appended rows into an immutable chunk and releases the
    /// append buffers back to the pool. Returns `None` for an empty builder.
    pub fn freeze(self) -> Option<Chunk> {
        if self.row_count == 0 {
            return None;
        }

        let col_bytes = self.row_count * CELL_BYTES;
        let mut out = Vec::with_capacity(22 + self.columns.len() * (5 + col_bytes));
        out.extend_from_slice(&(self.columns.len() as u16).to_le_bytes());
        out.extend_from_slice(&(self.row_count as u32).to_le_bytes());
        out.extend_from_slice(&self.min_ts.to_le_bytes());
        out.extend_from_slice(&self.max_ts.to_le_bytes());

        let mut columns = Vec::with_capacity(self.columns.len());
        for appender in &self.columns {
            out.push(kind_tag(appender.kind));
            out.extend_from_slice(&(col_bytes as u32).to_le_bytes());
            let start = out.len();
            out.extend_from_slice(&appender.buf[..col_bytes]);
            columns.push((appender.kind, start..start + col_bytes));
        }

        // Append buffers return to the pool when `self.columns` drops here.
        Some(Chunk {
            data: Bytes::from(out),
            row_count: self.row_count,
            min_ts: self.min_ts,
            max_ts: self.max_ts,
            columns,
        })
    }
}

fn kind_tag(kind: ColumnKind) -> u8 {
    match kind {
        ColumnKind::Long => 0,
        ColumnKind::Double => 1,
        ColumnKind::Str => 2,
        ColumnKind::Map => 3,
    }
}

fn kind_from_tag(tag: u8) -> Result<ColumnKind> {
    match tag {
        0 => Ok(ColumnKind::Long),
        1 => Ok(ColumnKind::Double),
        2 => Ok(ColumnKind::Str),
        3 => Ok(ColumnKind::Map),
        other => Err(MemSeriesError::DataCorruption(format!(
            "unknown chunk column kind tag {other}"
        ))),
    }
}

/// An immutable, columnar run of rows. Cheap to clone; the payload is shared.
#[derive(Debug, Clone)]
pub struct Chunk {
    data: Bytes,
    row_count: usize,
    min_ts: i64,
    max_ts: i64,
    columns: Vec<(ColumnKind, Range<usize>)>,
}

impl Chunk {
    /// Decodes a chunk from its wire bytes, validating all lengths.
    pub fn decode(data: Bytes) -> Result<Self> {
        let corrupt = |msg: &str| MemSeriesError::DataCorruption(msg.to_string());

        if data.len() < 22 {
            return Err(corrupt("chunk shorter than its header"));
        }
        let num_cols = u16::from_le_bytes([data[0], data[1]]) as usize;
        let row_count = u32::from_le_bytes([data[2], data[3], data[4], data[5]]) as usize;
        let min_ts = i64::from_le_bytes(data[6..14].try_into().expect("8 bytes"));
        let max_ts = i64::from_le_bytes(data[14..22].try_into().expect("8 bytes"));
        if num_cols == 0 || row_count == 0 {
            return Err(corrupt("chunk must have at least one column and row"));
        }

        let mut columns = Vec::with_capacity(num_cols);
        let mut pos = 22usize;
        for _ in 0..num_cols {
            if pos + 5 > data.len() {
                return Err(corrupt("truncated chunk column header"));
            }
            let kind = kind_from_tag(data[pos])?;
            let len = u32::from_le_bytes(data[pos + 1..pos + 5].try_into().expect("4 bytes"))
                as usize;
            pos += 5;
            if len != row_count * CELL_BYTES || pos + len > data.len() {
                return Err(corrupt("chunk column length does not match row count"));
            }
            columns.push((kind, pos..pos + len));
            pos += len;
        }
        if pos != data.len() {
            return Err(corrupt("trailing bytes after last chunk column"));
        }

        Ok(Self {
            data,
            row_count,
            min_ts,
            max_ts,
            columns,
        })
    }

    /// The encoded wire bytes.
    pub fn bytes(&self) -> Bytes {
        self.data.clone()
    }

    pub fn row_count(&self) -> usize {
        self.row_count
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn min_timestamp(&self) -> i64 {
        self.min_ts
    }

    pub fn max_timestamp(&self) -> i64 {
        self.max_ts
    }

    /// True when the chunk's time range intersects `[start, end]`.
    pub fn intersects(&self, start: i64, end: i64) -> bool {
        self.min_ts <= end && self.max_ts >= start
    }

    fn cell(&self, col: usize, row: usize) -> [u8; 8] {
        let range = &self.columns[col].1;
        let at = range.start + row * CELL_BYTES;
        self.data[at..at + CELL_BYTES]
            .try_into()
            .expect("cell is 8 bytes")
    }

    /// The value at (column, row).
    pub fn value_at(&self, col: usize, row: usize) -> FieldValue {
        let raw = self.cell(col, row);
        match self.columns[col].0 {
            ColumnKind::Double => FieldValue::Double(f64::from_bits(u64::from_le_bytes(raw))),
            _ => FieldValue::Long(i64::from_le_bytes(raw)),
        }
    }

    /// The row-key timestamp of a row.
    pub fn timestamp_at(&self, row: usize) -> i64 {
        i64::from_le_bytes(self.cell(0, row))
    }

    /// Materializes the chunk-column values of selected columns for rows
    /// whose timestamp lies in `[start, end]`.
    pub fn rows_in_range(
        &self,
        column_ids: &[u16],
        start: i64,
        end: i64,
    ) -> Vec<Vec<FieldValue>> {
        let mut rows = Vec::new();
        for row in 0..self.row_count {
            let ts = self.timestamp_at(row);
            if ts < start {
                continue;
            }
            if ts > end {
                break;
            }
            rows.push(
                column_ids
                    .iter()
                    .map(|&col| self.value_at(col as usize, row))
                    .collect(),
            );
        }
        rows
    }
}
