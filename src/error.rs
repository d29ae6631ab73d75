//! Error types for memseries.

use thiserror::Error;

/// Result type alias for memseries operations.
pub type Result<T> = std::result::Result<T, MemSeriesError>;

/// Main error type for memseries operations.
#[derive(Error, Debug)]
pub enum MemSeriesError {
    #[error("Shard {shard} of dataset '{dataset}' is already set up")]
    ShardAlreadySetup { dataset: String, shard: u32 },

    #[error("Shard {shard} of dataset '{dataset}' is not assigned to this node")]
    ShardNotAssigned { dataset: String, shard: u32 },

    #[error("Bad schema: {0}")]
    BadSchema(String),

    #[error("Buffer pool exhausted: requested {requested} bytes, {free} free")]
    BufferPoolExhausted { requested: usize, free: usize },

    #[error("Chunk is full at {rows} rows")]
    ChunkFull { rows: usize },

    #[error("Flush I/O error (transient: {transient}): {details}")]
    FlushIo { details: String, transient: bool },

    #[error("Index corruption in shard {shard}: {details}")]
    IndexCorruption { shard: u32, details: String },

    #[error("Data corruption detected: {0}")]
    DataCorruption(String),

    #[error("Ingestion already active for shard {shard} of dataset '{dataset}'")]
    IngestionAlreadyActive { dataset: String, shard: u32 },

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Store is shutting down")]
    ShuttingDown,

    #[error("Flush drain timed out after {timeout_ms}ms with {pending} tasks in flight")]
    FlushDrainTimeout { timeout_ms: u64, pending: usize },

    #[error("Channel send error for {channel}")]
    ChannelSend { channel: String },

    #[error("Channel receive error for {channel}")]
    ChannelReceive { channel: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bincode serialization error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("Other error: {0}")]
    Other(String),
}

impl MemSeriesError {
    /// True when a flush error should be retried with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, MemSeriesError::FlushIo { transient: true, .. })
    }
}

impl<T> From<crossbeam_channel::SendError<T>> for MemSeriesError {
    fn from(err: crossbeam_channel::SendError<T>) -> Self {
        MemSeriesError::ChannelSend {
            channel: format!("{:?}", err),
        }
    }
}

impl From<crossbeam_channel::RecvError> for MemSeriesError {
    fn from(err: crossbeam_channel::RecvError) -> Self {
        MemSeriesError::ChannelReceive {
            channel: format!("{:?}", err),
        }
    }
}
