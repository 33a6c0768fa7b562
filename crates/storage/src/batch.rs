//! Batch enrichment contract
//!
//! Online writes leave recordings with `processed=false`. A separate worker
//! process consumes them through these three operations, re-running the
//! full hybrid correction, retranscribing above the WER threshold, and
//! filling the intent/entity/topic blocks before marking the document
//! offline-processed. All three enforce tenant scoping.

use std::sync::Arc;

use callweave_core::{OrgId, RecordingId};

use crate::metadata::{Metadata, ProcessingMode};
use crate::recording::{RecordingStore, StoredRecording};
use crate::StorageError;

/// The surface exposed to the offline worker
pub struct BatchContract {
    store: Arc<RecordingStore>,
}

impl BatchContract {
    pub fn new(store: Arc<RecordingStore>) -> Self {
        Self { store }
    }

    /// Unprocessed recordings for one org, oldest-first up to `limit`
    pub async fn list_unprocessed(
        &self,
        org_id: OrgId,
        limit: usize,
    ) -> Result<Vec<Metadata>, StorageError> {
        let mut list = self.store.list_unprocessed(org_id, limit).await?;
        list.sort_by_key(|m| m.timestamp);
        Ok(list)
    }

    /// One recording with its audio path, org-scoped
    pub async fn get_recording(
        &self,
        org_id: OrgId,
        recording_id: RecordingId,
    ) -> Result<StoredRecording, StorageError> {
        self.store.get(org_id, recording_id).await
    }

    /// Replace the metadata after enrichment.
    ///
    /// The worker must hand back a document with `processed=true` and
    /// `processing_mode=offline`; anything else is rejected so a buggy
    /// worker cannot leave a recording half-claimed.
    pub async fn replace_metadata(
        &self,
        org_id: OrgId,
        recording_id: RecordingId,
        new_metadata: Metadata,
    ) -> Result<(), StorageError> {
        if !new_metadata.processed || new_metadata.processing_mode != ProcessingMode::Offline {
            return Err(StorageError::Encode(
                "enriched metadata must set processed=true, processing_mode=offline".to_string(),
            ));
        }
        self.store
            .replace_metadata(org_id, recording_id, new_metadata)
            .await
    }
}
