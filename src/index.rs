//! Per-shard inverted index over partition-key labels.
//!
//! Writes are serialized by the shard's ingestion thread; readers see
//! copy-on-write posting lists and never block the writer. Mutations are
//! tracked per flush group and drained into serializable time buckets that
//! persist alongside the group's chunks.

use crate::error::{MemSeriesError, Result};
use crate::partkey::Label;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

/// A label predicate for partition lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnFilter {
    Equals { label: String, value: String },
    In { label: String, values: Vec<String> },
}

impl ColumnFilter {
    /// Shorthand for an equality filter.
    pub fn equals(label: impl Into<String>, value: impl Into<String>) -> Self {
        ColumnFilter::Equals {
            label: label.into(),
            value: value.into(),
        }
    }
}

struct KeyEntry {
    key: Vec<u8>,
    labels: Vec<Label>,
    group: usize,
    first_ts: AtomicI64,
    last_ts: AtomicI64,
}

/// One index entry as persisted in a time bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketEntry {
    pub part_id: u32,
    pub key: Vec<u8>,
    pub labels: Vec<Label>,
    pub first_ts: i64,
    pub last_ts: i64,
}

/// A serializable snapshot of index mutations for one group since the
/// previous snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexTimeBucket {
    pub group: usize,
    pub sequence: u64,
    pub entries: Vec<BucketEntry>,
    pub removed: Vec<u32>,
}

/// Inverted index: label pair -> set of active partition ids.
pub struct PartitionKeyIndex {
    shard: u32,
    postings: DashMap<Label, Arc<Vec<u32>>>,
    entries: DashMap<u32, Arc<KeyEntry>>,
    by_key: DashMap<Vec<u8>, u32>,
    dirty: Vec<Mutex<DirtySet>>,
    bucket_seq: Vec<AtomicU64>,
}

#[derive(Default)]
struct DirtySet {
    touched: HashSet<u32>,
    removed: HashSet<u32>,
}

impl PartitionKeyIndex {
    pub fn new(shard: u32, groups: usize) -> Self {
        Self {
            shard,
            postings: DashMap::new(),
            entries: DashMap::new(),
            by_key: DashMap::new(),
            dirty: (0..groups).map(|_| Mutex::new(DirtySet::default())).collect(),
            bucket_seq: (0..groups).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    /// Registers a newly created partition. An entry already present for the
    /// same key and id (a recovered series coming back to life) is kept with
    /// its observed time range; a stale entry under a different id is
    /// replaced. Ingestion thread only.
    pub fn add_key(&self, part_id: u32, group: usize, key: Vec<u8>, labels: Vec<Label>) {
        match self.by_key.get(&key).map(|id| *id) {
            Some(existing) if existing == part_id => {
                let mut dirty = self.dirty[group].lock();
                dirty.touched.insert(part_id);
                dirty.removed.remove(&part_id);
                return;
            }
            Some(stale) => self.remove_key(stale),
            None => {}
        }

        for label in &labels {
            self.posting_insert(label.clone(), part_id);
        }
        self.by_key.insert(key.clone(), part_id);
        self.entries.insert(
            part_id,
            Arc::new(KeyEntry {
                key,
                labels,
                group,
                first_ts: AtomicI64::new(i64::MAX),
                last_ts: AtomicI64::new(i64::MIN),
            }),
        );
        let mut dirty = self.dirty[group].lock();
        dirty.touched.insert(part_id);
        dirty.removed.remove(&part_id);
    }

    /// Removes an evicted partition from the postings. Ingestion thread only.
    pub fn remove_key(&self, part_id: u32) {
        let Some((_, entry)) = self.entries.remove(&part_id) else {
            return;
        };
        for label in &entry.labels {
            self.posting_remove(label, part_id);
        }
        self.by_key.remove_if(&entry.key, |_, id| *id == part_id);
        let mut dirty = self.dirty[entry.group].lock();
        dirty.touched.remove(&part_id);
        dirty.removed.insert(part_id);
    }

    /// The partition id currently registered for a key, if any.
    pub fn part_id_of(&self, key: &[u8]) -> Option<u32> {
        self.by_key.get(key).map(|id| *id)
    }

    /// The highest partition id the index knows about.
    pub fn max_part_id(&self) -> Option<u32> {
        self.entries.iter().map(|e| *e.key()).max()
    }

    /// Extends the observed time range of a partition. Ingestion thread only.
    pub fn observe(&self, part_id: u32, timestamp: i64) {
        let Some(entry) = self.entries.get(&part_id).map(|e| Arc::clone(e.value())) else {
            return;
        };
        let mut changed = false;
        if timestamp < entry.first_ts.load(Ordering::Relaxed) {
            entry.first_ts.store(timestamp, Ordering::Relaxed);
            changed = true;
        }
        if timestamp > entry.last_ts.load(Ordering::Relaxed) {
            entry.last_ts.store(timestamp, Ordering::Relaxed);
            changed = true;
        }
        if changed {
            self.dirty[entry.group].lock().touched.insert(part_id);
        }
    }

    fn posting_insert(&self, label: Label, part_id: u32) {
        let mut slot = self.postings.entry(label).or_insert_with(|| Arc::new(Vec::new()));
        if slot.binary_search(&part_id).is_err() {
            let mut next = Vec::with_capacity(slot.len() + 1);
            next.extend_from_slice(slot.as_slice());
            let at = next.partition_point(|&id| id < part_id);
            next.insert(at, part_id);
            *slot = Arc::new(next);
        }
    }

    fn posting_remove(&self, label: &Label, part_id: u32) {
        let mut empty = false;
        if let Some(mut slot) = self.postings.get_mut(label) {
            if let Ok(at) = slot.binary_search(&part_id) {
                let mut next = slot.as_slice().to_vec();
                next.remove(at);
                empty = next.is_empty();
                *slot = Arc::new(next);
            }
        }
        if empty {
            self.postings.remove_if(label, |_, ids| ids.is_empty());
        }
    }

    /// Distinct label names present in the index.
    pub fn label_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .postings
            .iter()
            .map(|e| e.key().name.clone())
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }

    /// The `top_k` most frequent values for a label name, ordered by
    /// descending frequency with lexicographic tiebreak.
    pub fn values_for(&self, label_name: &str, top_k: usize) -> Vec<String> {
        let mut freqs: Vec<(usize, String)> = self
            .postings
            .iter()
            .filter(|e| e.key().name == label_name)
            .map(|e| (e.value().len(), e.key().value.clone()))
            .collect();
        freqs.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        freqs.truncate(top_k);
        freqs.into_iter().map(|(_, v)| v).collect()
    }

    fn posting_for(&self, filter: &ColumnFilter) -> Vec<u32> {
        match filter {
            ColumnFilter::Equals { label, value } => self
                .postings
                .get(&Label::new(label.clone(), value.clone()))
                .map(|ids| ids.as_slice().to_vec())
                .unwrap_or_default(),
            ColumnFilter::In { label, values } => {
                let mut merged: Vec<u32> = Vec::new();
                for value in values {
                    if let Some(ids) =
                        self.postings.get(&Label::new(label.clone(), value.clone()))
                    {
                        merged.extend_from_slice(ids.as_slice());
                    }
                }
                merged.sort_unstable();
                merged.dedup();
                merged
            }
        }
    }

    /// Partition ids matching every filter whose observed time range
    /// intersects `[start, end]`, up to `limit`.
    pub fn filter(
        &self,
        filters: &[ColumnFilter],
        start: i64,
        end: i64,
        limit: usize,
    ) -> Vec<u32> {
        let mut candidates: Option<Vec<u32>> = None;
        for filter in filters {
            let ids = self.posting_for(filter);
            candidates = Some(match candidates {
                None => ids,
                Some(prev) => intersect_sorted(&prev, &ids),
            });
            if candidates.as_ref().is_some_and(Vec::is_empty) {
                return Vec::new();
            }
        }

        let candidates = match candidates {
            Some(ids) => ids,
            // No filters: every known partition is a candidate.
            None => {
                let mut ids: Vec<u32> = self.entries.iter().map(|e| *e.key()).collect();
                ids.sort_unstable();
                ids
            }
        };

        let mut out = Vec::new();
        for id in candidates {
            let Some(entry) = self.entries.get(&id) else {
                continue;
            };
            let first = entry.first_ts.load(Ordering::Relaxed);
            let last = entry.last_ts.load(Ordering::Relaxed);
            // A partition with no observed rows matches any window.
            if first > last || (first <= end && last >= start) {
                out.push(id);
                if out.len() >= limit {
                    break;
                }
            }
        }
        out
    }

    /// The `top_k` most frequent values of `label_name` among partitions
    /// matching every filter within `[start, end]`.
    pub fn values_for_filtered(
        &self,
        label_name: &str,
        filters: &[ColumnFilter],
        start: i64,
        end: i64,
        top_k: usize,
    ) -> Vec<String> {
        let ids = self.filter(filters, start, end, usize::MAX);
        let mut freqs: std::collections::HashMap<String, usize> =
            std::collections::HashMap::new();
        for id in ids {
            let Some(entry) = self.entries.get(&id) else {
                continue;
            };
            for label in &entry.labels {
                if label.name == label_name {
                    *freqs.entry(label.value.clone()).or_insert(0) += 1;
                }
            }
        }
        let mut ordered: Vec<(usize, String)> =
            freqs.into_iter().map(|(v, n)| (n, v)).collect();
        ordered.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
        ordered.truncate(top_k);
        ordered.into_iter().map(|(_, v)| v).collect()
    }

    /// Encoded partition keys for the given ids.
    pub fn keys_of(&self, part_ids: &[u32]) -> Vec<Vec<u8>> {
        part_ids
            .iter()
            .filter_map(|id| self.entries.get(id).map(|e| e.key.clone()))
            .collect()
    }

    /// Drains the mutations recorded for `group` since its previous snapshot
    /// into a serializable time bucket. Sequences are monotonic per group.
    pub fn snapshot_bucket(&self, group: usize) -> Result<Vec<u8>> {
        let (touched, removed) = {
            let mut dirty = self.dirty[group].lock();
            (
                std::mem::take(&mut dirty.touched),
                std::mem::take(&mut dirty.removed),
            )
        };

        let mut entries: Vec<BucketEntry> = touched
            .into_iter()
            .filter_map(|id| {
                self.entries.get(&id).map(|entry| BucketEntry {
                    part_id: id,
                    key: entry.key.clone(),
                    labels: entry.labels.clone(),
                    first_ts: entry.first_ts.load(Ordering::Relaxed),
                    last_ts: entry.last_ts.load(Ordering::Relaxed),
                })
            })
            .collect();
        entries.sort_by_key(|e| e.part_id);
        let mut removed: Vec<u32> = removed.into_iter().collect();
        removed.sort_unstable();

        let bucket = IndexTimeBucket {
            group,
            sequence: self.bucket_seq[group].fetch_add(1, Ordering::AcqRel) + 1,
            entries,
            removed,
        };
        Ok(bincode::serialize(&bucket)?)
    }

    /// Applies a persisted time bucket while rebuilding the index.
    pub fn restore_bucket(&self, blob: &[u8]) -> Result<()> {
        let bucket: IndexTimeBucket =
            bincode::deserialize(blob).map_err(|e| MemSeriesError::IndexCorruption {
                shard: self.shard,
                details: e.to_string(),
            })?;
        if bucket.group >= self.dirty.len() {
            return Err(MemSeriesError::IndexCorruption {
                shard: self.shard,
                details: format!(
                    "bucket group {} out of range ({} groups)",
                    bucket.group,
                    self.dirty.len()
                ),
            });
        }

        for entry in bucket.entries {
            self.add_key(entry.part_id, bucket.group, entry.key, entry.labels);
            if entry.first_ts <= entry.last_ts {
                self.observe(entry.part_id, entry.first_ts);
                self.observe(entry.part_id, entry.last_ts);
            }
        }
        for part_id in bucket.removed {
            self.remove_key(part_id);
        }

        // Keep snapshot sequences ahead of everything already persisted.
        let seq = &self.bucket_seq[bucket.group];
        let mut current = seq.load(Ordering::Acquire);
        while current < bucket.sequence {
            match seq.compare_exchange_weak(
                current,
                bucket.sequence,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(now) => current = now,
            }
        }
        Ok(())
    }

    /// Number of partitions currently indexed.
    pub fn num_entries(&self) -> usize {
        self.entries.len()
    }
}

fn intersect_sorted(a: &[u32], b: &[u32]) -> Vec<u32> {
    let mut out = Vec::with_capacity(a.len().min(b.len()));
    let (mut i, mut j) = (0usize, 0usize);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                out.push(a[i]);
                i += 1;
                j += 1;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host_labels(host: &str) -> Vec<Label> {
        vec![Label::new("host", host), Label::new("job", "node")]
    }

    #[test]
    fn add_and_filter_by_label() {
        let index = PartitionKeyIndex::new(0, 2);
        index.add_key(1, 0, b"k1".to_vec(), host_labels("a"));
        index.add_key(2, 1, b"k2".to_vec(), host_labels("b"));
        index.observe(1, 10);
        index.observe(2, 20);

        let ids = index.filter(&[ColumnFilter::equals("host", "a")], 0, 100, 10);
        assert_eq!(ids, vec![1]);

        let ids = index.filter(&[ColumnFilter::equals("job", "node")], 0, 100, 10);
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn filter_respects_observed_time_ranges() {
        let index = PartitionKeyIndex::new(0, 1);
        index.add_key(1, 0, b"k1".to_vec(), host_labels("a"));
        index.observe(1, 10);
        index.observe(1, 20);

        assert!(index
            .filter(&[ColumnFilter::equals("host", "a")], 30, 40, 10)
            .is_empty());
        assert_eq!(
            index.filter(&[ColumnFilter::equals("host", "a")], 15, 40, 10),
            vec![1]
        );
    }

    #[test]
    fn filter_honors_limit() {
        let index = PartitionKeyIndex::new(0, 1);
        for id in 0..10 {
            index.add_key(id, 0, vec![id as u8], host_labels("a"));
            index.observe(id, 5);
        }
        let ids = index.filter(&[ColumnFilter::equals("host", "a")], 0, 10, 3);
        assert_eq!(ids.len(), 3);
    }

    #[test]
    fn values_for_orders_by_frequency_then_lexicographically() {
        let index = PartitionKeyIndex::new(0, 1);
        index.add_key(1, 0, b"k1".to_vec(), vec![Label::new("host", "b")]);
        index.add_key(2, 0, b"k2".to_vec(), vec![Label::new("host", "b")]);
        index.add_key(3, 0, b"k3".to_vec(), vec![Label::new("host", "a")]);
        index.add_key(4, 0, b"k4".to_vec(), vec![Label::new("host", "c")]);

        assert_eq!(index.values_for("host", 10), vec!["b", "a", "c"]);
        assert_eq!(index.values_for("host", 1), vec!["b"]);
    }

    #[test]
    fn remove_key_clears_postings() {
        let index = PartitionKeyIndex::new(0, 1);
        index.add_key(1, 0, b"k1".to_vec(), host_labels("a"));
        index.remove_key(1);

        assert!(index
            .filter(&[ColumnFilter::equals("host", "a")], 0, 100, 10)
            .is_empty());
        assert_eq!(index.num_entries(), 0);
    }

    #[test]
    fn snapshot_drains_dirty_state_and_is_monotonic() {
        let index = PartitionKeyIndex::new(0, 2);
        index.add_key(1, 0, b"k1".to_vec(), host_labels("a"));
        index.observe(1, 10);

        let blob1 = index.snapshot_bucket(0).unwrap();
        let bucket1: IndexTimeBucket = bincode::deserialize(&blob1).unwrap();
        assert_eq!(bucket1.sequence, 1);
        assert_eq!(bucket1.entries.len(), 1);

        // Nothing changed for group 0 since the first snapshot.
        let blob2 = index.snapshot_bucket(0).unwrap();
        let bucket2: IndexTimeBucket = bincode::deserialize(&blob2).unwrap();
        assert_eq!(bucket2.sequence, 2);
        assert!(bucket2.entries.is_empty());
    }

    #[test]
    fn restore_bucket_rebuilds_entries() {
        let source = PartitionKeyIndex::new(0, 1);
        source.add_key(7, 0, b"k7".to_vec(), host_labels("a"));
        source.observe(7, 42);
        let blob = source.snapshot_bucket(0).unwrap();

        let rebuilt = PartitionKeyIndex::new(0, 1);
        rebuilt.restore_bucket(&blob).unwrap();
        assert_eq!(
            rebuilt.filter(&[ColumnFilter::equals("host", "a")], 0, 100, 10),
            vec![7]
        );
        assert_eq!(rebuilt.keys_of(&[7]), vec![b"k7".to_vec()]);
    }

    #[test]
    fn restore_rejects_garbage_blobs() {
        let index = PartitionKeyIndex::new(3, 1);
        let err = index.restore_bucket(&[0xff; 4]).unwrap_err();
        assert!(matches!(
            err,
            MemSeriesError::IndexCorruption { shard: 3, .. }
        ));
    }
}
