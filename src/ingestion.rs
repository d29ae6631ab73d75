//! Ingestion stream interfaces.
//!
//! A stream is a lazy, restartable sequence of record batches tagged with
//! source offsets. Stream errors surface as a terminal error item rather
//! than a panic, so consumers always observe an orderly end of stream.

use crate::error::Result;
use crate::schema::Dataset;
use crate::RecordBatch;
use std::collections::HashMap;

/// A lazy sequence of record batches. The stream ends after yielding `None`;
/// a terminal failure is the last `Err` item before that.
pub trait IngestionStream: Iterator<Item = Result<RecordBatch>> + Send {}

impl<T> IngestionStream for T where T: Iterator<Item = Result<RecordBatch>> + Send {}

/// Commands the shard to flush one group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushCommand {
    pub group: usize,
}

/// Creates ingestion streams for a dataset shard. `config` is a free-form
/// keyed map whose recognized keys are stream-type specific.
pub trait IngestionStreamFactory: Send + Sync {
    fn create(
        &self,
        config: &HashMap<String, String>,
        dataset: &Dataset,
        shard: u32,
        offset: Option<i64>,
    ) -> Result<Box<dyn IngestionStream>>;
}

/// In-memory stream over a fixed batch vector, restartable from an offset.
pub struct VecStream {
    batches: Vec<RecordBatch>,
    pos: usize,
}

impl VecStream {
    pub fn new(batches: Vec<RecordBatch>) -> Self {
        Self { batches, pos: 0 }
    }

    /// Restarts the stream at the first batch at or past `offset`.
    pub fn starting_at(mut self, offset: i64) -> Self {
        self.pos = self.batches.partition_point(|b| b.offset() < offset);
        self
    }
}

impl Iterator for VecStream {
    type Item = Result<RecordBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        let batch = self.batches.get(self.pos)?.clone();
        self.pos += 1;
        Some(Ok(batch))
    }
}

/// Progress events yielded while replaying a stream during recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryEvent {
    /// Replay has reached this source offset.
    Progress(i64),
    /// Replay finished at the end offset.
    Complete(i64),
}
