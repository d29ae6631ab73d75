//! Dataset schemas and scan projections.

use crate::error::{MemSeriesError, Result};
use crate::{FieldValue, Record};
use serde::{Deserialize, Serialize};

/// The kind of values a column holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnKind {
    Long,
    Double,
    Str,
    Map,
}

/// A named, typed column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub kind: ColumnKind,
}

impl Column {
    pub fn new(name: impl Into<String>, kind: ColumnKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Shape of a dataset's partition key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyType {
    Scalar(ColumnKind),
    Composite(Vec<ColumnKind>),
}

/// A dataset schema: ordered partition-key columns, row-key columns and data
/// columns. Immutable after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dataset {
    name: String,
    partition_columns: Vec<Column>,
    row_key_columns: Vec<Column>,
    data_columns: Vec<Column>,
}

impl Dataset {
    /// Creates a validated dataset schema.
    pub fn new(
        name: impl Into<String>,
        partition_columns: Vec<Column>,
        row_key_columns: Vec<Column>,
        data_columns: Vec<Column>,
    ) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(MemSeriesError::BadSchema(
                "dataset name must be non-empty".to_string(),
            ));
        }
        if partition_columns.is_empty() {
            return Err(MemSeriesError::BadSchema(
                "at least one partition column is required".to_string(),
            ));
        }
        if row_key_columns.is_empty() {
            return Err(MemSeriesError::BadSchema(
                "at least one row-key column is required".to_string(),
            ));
        }
        if row_key_columns[0].kind != ColumnKind::Long {
            return Err(MemSeriesError::BadSchema(format!(
                "first row-key column '{}' must be Long",
                row_key_columns[0].name
            )));
        }
        if data_columns.is_empty() {
            return Err(MemSeriesError::BadSchema(
                "at least one data column is required".to_string(),
            ));
        }
        for col in &row_key_columns {
            if !matches!(col.kind, ColumnKind::Long | ColumnKind::Double) {
                return Err(MemSeriesError::BadSchema(format!(
                    "row-key column '{}' must be Long or Double",
                    col.name
                )));
            }
        }
        for col in &data_columns {
            if !matches!(col.kind, ColumnKind::Long | ColumnKind::Double) {
                return Err(MemSeriesError::BadSchema(format!(
                    "data column '{}' must be Long or Double",
                    col.name
                )));
            }
        }
        for col in &partition_columns {
            if matches!(col.kind, ColumnKind::Double) {
                return Err(MemSeriesError::BadSchema(format!(
                    "partition column '{}' must not be Double",
                    col.name
                )));
            }
        }

        let mut names: Vec<&str> = partition_columns
            .iter()
            .chain(row_key_columns.iter())
            .chain(data_columns.iter())
            .map(|c| c.name.as_str())
            .collect();
        if names.iter().any(|n| n.is_empty()) {
            return Err(MemSeriesError::BadSchema(
                "column names must be non-empty".to_string(),
            ));
        }
        names.sort_unstable();
        if names.windows(2).any(|w| w[0] == w[1]) {
            return Err(MemSeriesError::BadSchema(
                "column names must be unique".to_string(),
            ));
        }

        Ok(Self {
            name,
            partition_columns,
            row_key_columns,
            data_columns,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn partition_columns(&self) -> &[Column] {
        &self.partition_columns
    }

    pub fn row_key_columns(&self) -> &[Column] {
        &self.row_key_columns
    }

    pub fn data_columns(&self) -> &[Column] {
        &self.data_columns
    }

    /// The shape of this dataset's partition key.
    pub fn key_type(&self) -> KeyType {
        if self.partition_columns.len() == 1 {
            KeyType::Scalar(self.partition_columns[0].kind)
        } else {
            KeyType::Composite(self.partition_columns.iter().map(|c| c.kind).collect())
        }
    }

    /// Columns stored in chunks, in chunk column-id order: row-key columns
    /// followed by data columns.
    pub fn chunk_columns(&self) -> impl Iterator<Item = &Column> {
        self.row_key_columns.iter().chain(self.data_columns.iter())
    }

    /// Number of columns stored per chunk row.
    pub fn num_chunk_columns(&self) -> usize {
        self.row_key_columns.len() + self.data_columns.len()
    }

    /// Total number of columns a record must carry.
    pub fn num_record_columns(&self) -> usize {
        self.partition_columns.len() + self.num_chunk_columns()
    }

    /// Absolute record position of the first row-key column.
    pub fn row_key_pos(&self) -> usize {
        self.partition_columns.len()
    }

    /// The row-key timestamp of a record, if the record is well formed.
    pub fn timestamp_of(&self, record: &Record) -> Option<i64> {
        record.value(self.row_key_pos()).and_then(FieldValue::as_long)
    }

    /// Checks a record's arity and per-column kinds against the schema.
    pub fn validate_record(&self, record: &Record) -> Result<()> {
        if record.len() != self.num_record_columns() {
            return Err(MemSeriesError::BadSchema(format!(
                "record has {} values, schema '{}' expects {}",
                record.len(),
                self.name,
                self.num_record_columns()
            )));
        }
        let all = self
            .partition_columns
            .iter()
            .chain(self.chunk_columns());
        for (pos, col) in all.enumerate() {
            let matches = match (col.kind, &record.values()[pos]) {
                (ColumnKind::Long, FieldValue::Long(_)) => true,
                (ColumnKind::Double, FieldValue::Double(_)) => true,
                (ColumnKind::Str, FieldValue::Str(_)) => true,
                (ColumnKind::Map, FieldValue::Map(_)) => true,
                _ => false,
            };
            if !matches {
                return Err(MemSeriesError::BadSchema(format!(
                    "value at position {pos} does not match column '{}' ({:?})",
                    col.name, col.kind
                )));
            }
        }
        Ok(())
    }
}

/// A validated selection of chunk columns for a scan.
#[derive(Debug, Clone)]
pub struct Projection {
    column_ids: Vec<u16>,
}

impl Projection {
    /// Resolves column ids against a dataset. Ids index into the chunk
    /// columns (row-key columns first, then data columns).
    pub fn new(dataset: &Dataset, column_ids: Vec<u16>) -> Result<Self> {
        let max = dataset.num_chunk_columns();
        for &id in &column_ids {
            if id as usize >= max {
                return Err(MemSeriesError::BadSchema(format!(
                    "column id {id} out of range for dataset '{}' ({max} chunk columns)",
                    dataset.name()
                )));
            }
        }
        Ok(Self { column_ids })
    }

    /// Projection over every chunk column of the dataset.
    pub fn all(dataset: &Dataset) -> Self {
        Self {
            column_ids: (0..dataset.num_chunk_columns() as u16).collect(),
        }
    }

    pub fn column_ids(&self) -> &[u16] {
        &self.column_ids
    }
}
