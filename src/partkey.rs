//! Partition keys and labels.
//!
//! A partition key is the concatenation of a record's partition-column values
//! encoded as an opaque byte sequence; equality and hashing are byte-wise.
//! Labels are the searchable key/value pairs a partition key decomposes into.

use crate::error::{MemSeriesError, Result};
use crate::schema::{ColumnKind, Dataset, KeyType};
use crate::{FieldValue, Record};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Maximum byte length of an indexable label name.
pub const MAX_LABEL_NAME_LEN: usize = 256;

/// Maximum byte length of an indexable label value.
pub const MAX_LABEL_VALUE_LEN: usize = 16 * 1024;

const TAG_SCALAR: u8 = 0;
const TAG_COMPOSITE: u8 = 1;

/// A searchable key/value pair extracted from a partition key.
///
/// Labels sort by name, then value (the derived order of the fields), which
/// is also the order they are laid out in an encoded key. A label is only
/// indexable when both parts are non-empty and within the size caps; labels
/// that fail [`Label::is_valid`] are skipped during key decoding rather
/// than mangled to fit.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    pub value: String,
}

impl Label {
    /// Creates a new label.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// True when the label can enter the index: both parts non-empty and
    /// within the byte caps.
    pub fn is_valid(&self) -> bool {
        !self.name.is_empty()
            && !self.value.is_empty()
            && self.name.len() <= MAX_LABEL_NAME_LEN
            && self.value.len() <= MAX_LABEL_VALUE_LEN
    }
}

/// Deterministic 64-bit FNV-1a over the encoded key bytes. Drives both the
/// partition table bucket and the flush-group assignment, so it must be
/// stable across processes.
pub fn hash_key(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

fn encode_value(kind: ColumnKind, value: &FieldValue, out: &mut Vec<u8>) -> Result<()> {
    match (kind, value) {
        (ColumnKind::Long, FieldValue::Long(v)) => {
            out.extend_from_slice(&v.to_le_bytes());
        }
        (ColumnKind::Str, FieldValue::Str(s)) => {
            let bytes = s.as_bytes();
            let len = bytes.len().min(u16::MAX as usize);
            out.extend_from_slice(&(len as u16).to_le_bytes());
            out.extend_from_slice(&bytes[..len]);
        }
        (ColumnKind::Map, FieldValue::Map(map)) => {
            let count = map.len().min(u16::MAX as usize);
            out.extend_from_slice(&(count as u16).to_le_bytes());
            for (k, v) in map.iter().take(count) {
                for part in [k.as_str(), v.as_str()] {
                    let bytes = part.as_bytes();
                    let len = bytes.len().min(u16::MAX as usize);
                    out.extend_from_slice(&(len as u16).to_le_bytes());
                    out.extend_from_slice(&bytes[..len]);
                }
            }
        }
        _ => {
            return Err(MemSeriesError::BadSchema(format!(
                "partition value {value} does not match column kind {kind:?}"
            )));
        }
    }
    Ok(())
}

/// Encodes a record's partition-column values into an opaque key.
pub fn encode_partition_key(dataset: &Dataset, record: &Record) -> Result<Vec<u8>> {
    let columns = dataset.partition_columns();
    if record.len() < columns.len() {
        return Err(MemSeriesError::BadSchema(format!(
            "record has {} values, {} partition columns required",
            record.len(),
            columns.len()
        )));
    }

    let mut out = Vec::with_capacity(32);
    match dataset.key_type() {
        KeyType::Scalar(kind) => {
            out.push(TAG_SCALAR);
            out.push(kind_tag(kind));
            encode_value(kind, &record.values()[0], &mut out)?;
        }
        KeyType::Composite(kinds) => {
            out.push(TAG_COMPOSITE);
            out.push(kinds.len() as u8);
            for (i, kind) in kinds.iter().enumerate() {
                out.push(kind_tag(*kind));
                encode_value(*kind, &record.values()[i], &mut out)?;
            }
        }
    }
    Ok(out)
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
        other => Err(MemSeriesError::Other(format!(
            "unknown column kind tag {other} in partition key"
        ))),
    }
}

struct KeyReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> KeyReader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.bytes.len() {
            return Err(MemSeriesError::Other(
                "truncated partition key".to_string(),
            ));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn str_field(&mut self) -> Result<String> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| MemSeriesError::Other(format!("partition key is not UTF-8: {e}")))
    }

    fn value(&mut self, kind: ColumnKind) -> Result<FieldValue> {
        match kind {
            ColumnKind::Long => {
                let b = self.take(8)?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(b);
                Ok(FieldValue::Long(i64::from_le_bytes(raw)))
            }
            ColumnKind::Str => Ok(FieldValue::Str(self.str_field()?)),
            ColumnKind::Map => {
                let count = self.u16()? as usize;
                let mut map = BTreeMap::new();
                for _ in 0..count {
                    let k = self.str_field()?;
                    let v = self.str_field()?;
                    map.insert(k, v);
                }
                Ok(FieldValue::Map(map))
            }
            ColumnKind::Double => Err(MemSeriesError::Other(
                "double partition values are not supported".to_string(),
            )),
        }
    }
}

/// Decodes an opaque partition key back into its column values.
pub fn decode_partition_key(bytes: &[u8]) -> Result<Vec<FieldValue>> {
    let mut reader = KeyReader { bytes, pos: 0 };
    match reader.u8()? {
        TAG_SCALAR => {
            let kind = kind_from_tag(reader.u8()?)?;
            Ok(vec![reader.value(kind)?])
        }
        TAG_COMPOSITE => {
            let count = reader.u8()? as usize;
            let mut values = Vec::with_capacity(count);
            for _ in 0..count {
                let kind = kind_from_tag(reader.u8()?)?;
                values.push(reader.value(kind)?);
            }
            Ok(values)
        }
        other => Err(MemSeriesError::Other(format!(
            "unknown partition key tag {other}"
        ))),
    }
}

/// Labels contributed by one partition-column value.
fn labels_of_value(column_name: &str, value: &FieldValue, out: &mut Vec<Label>) {
    match value {
        FieldValue::Map(map) => {
            for (k, v) in map {
                out.push(Label::new(k.clone(), v.clone()));
            }
        }
        FieldValue::Str(s) => out.push(Label::new(column_name, s.clone())),
        FieldValue::Long(v) => out.push(Label::new(column_name, v.to_string())),
        FieldValue::Double(v) => out.push(Label::new(column_name, v.to_string())),
    }
}

/// Extracts the searchable labels of an encoded partition key.
pub fn labels_from_key(dataset: &Dataset, key: &[u8]) -> Result<Vec<Label>> {
    let values = decode_partition_key(key)?;
    let mut labels = Vec::new();
    for (column, value) in dataset.partition_columns().iter().zip(values.iter()) {
        labels_of_value(&column.name, value, &mut labels);
    }
    labels.retain(Label::is_valid);
    labels.sort();
    Ok(labels)
}
