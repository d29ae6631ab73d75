//! memseries - a sharded in-memory time-series memstore
//!
//! memseries buffers columnar record batches into pooled chunk memory, grouped
//! by partition key, and periodically flushes immutable chunk sets to an
//! external column store while serving scans and label lookups over the hot
//! in-memory window.

pub mod chunk;
pub mod columnstore;
pub mod config;
pub mod downsample;
pub mod error;
pub mod eviction;
pub mod flush;
pub mod index;
pub mod ingestion;
pub mod partition;
pub mod partkey;
pub mod pool;
pub mod schema;
pub mod shard;
pub mod store;
pub mod table;

pub use config::{StoreConfig, StoreConfigBuilder};
pub use error::{MemSeriesError, Result};
pub use partkey::Label;
pub use schema::{ColumnKind, Dataset, KeyType, Projection};
pub use store::MemStore;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A single field value within a record, tagged by column kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Long(i64),
    Double(f64),
    Str(String),
    Map(BTreeMap<String, String>),
}

impl FieldValue {
    /// Returns the long payload if this value is a `Long`.
    pub fn as_long(&self) -> Option<i64> {
        match self {
            FieldValue::Long(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the double payload if this value is a `Double`.
    pub fn as_double(&self) -> Option<f64> {
        match self {
            FieldValue::Double(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Long(v) => write!(f, "{v}"),
            FieldValue::Double(v) => write!(f, "{v}"),
            FieldValue::Str(v) => write!(f, "{v}"),
            FieldValue::Map(m) => {
                write!(f, "{{")?;
                for (i, (k, v)) in m.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{k}={v}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

/// One row in dataset column order: partition columns first, then row-key
/// columns, then data columns.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    values: Vec<FieldValue>,
}

impl Record {
    /// Creates a record from values in dataset column order.
    pub fn new(values: Vec<FieldValue>) -> Self {
        Self { values }
    }

    /// All values in column order.
    pub fn values(&self) -> &[FieldValue] {
        &self.values
    }

    /// Value at the given column position.
    pub fn value(&self, pos: usize) -> Option<&FieldValue> {
        self.values.get(pos)
    }

    /// Number of values in the record.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True when the record carries no values.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A batch of records tagged with the source offset it was read at.
#[derive(Debug, Clone)]
pub struct RecordBatch {
    records: Vec<Record>,
    offset: i64,
}

impl RecordBatch {
    /// Creates a batch of records at a source offset.
    pub fn new(records: Vec<Record>, offset: i64) -> Self {
        Self { records, offset }
    }

    /// The records in this batch.
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// The source offset this batch was read at.
    pub fn offset(&self) -> i64 {
        self.offset
    }
}
