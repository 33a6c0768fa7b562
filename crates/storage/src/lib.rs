//! Recording and metadata storage
//!
//! Each recording is an audio artifact plus one canonical metadata
//! document; a recording is visible only when both exist with a matching
//! checksum. The local filesystem is authoritative; an object store can
//! mirror it best-effort. Online writes mark recordings unprocessed for the
//! offline enrichment worker.

mod batch;
mod metadata;
mod recording;
mod remote;

pub use batch::BatchContract;
pub use metadata::{
    AudioDescriptor, EntityBlock, IntentBlock, Metadata, ProcessingMetrics, ProcessingMode,
    SentimentBlock, TopicBlock, TranscriptionBlock, TurnSummary,
};
pub use recording::{RecordingStore, StoredRecording};
pub use remote::{BlobStore, HttpBlobStore};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("encode: {0}")]
    Encode(String),

    #[error("checksum mismatch for {0}")]
    ChecksumMismatch(String),

    #[error("recording not found")]
    NotFound,

    #[error("remote store: {0}")]
    Remote(String),
}

impl From<StorageError> for callweave_core::Error {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound => callweave_core::Error::NotFound,
            StorageError::ChecksumMismatch(what) => {
                callweave_core::Error::invariant(format!("checksum mismatch for {}", what))
            }
            other => callweave_core::Error::dependency("storage", other),
        }
    }
}
