//! Per-call voice profile store
//!
//! A fixed-dimension speaker embedding built once from the first seconds of
//! qualifying speech, read-only afterwards, and removed with the session.

use dashmap::DashMap;
use std::sync::Arc;

use callweave_core::{CallId, Error, Result};

/// Expected embedding dimension; mismatches are invariant violations
pub const EMBEDDING_DIM: usize = 256;

/// Shared store of per-call embeddings
#[derive(Debug, Default)]
pub struct VoiceProfileStore {
    profiles: DashMap<CallId, Arc<Vec<f32>>>,
}

impl VoiceProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a freshly created embedding.
    ///
    /// A second creation for the same call breaks the at-most-once
    /// invariant.
    pub fn create(&self, call_id: CallId, embedding: Vec<f32>) -> Result<()> {
        if embedding.len() != EMBEDDING_DIM {
            return Err(Error::invariant(format!(
                "voice profile dimension {} != {}",
                embedding.len(),
                EMBEDDING_DIM
            )));
        }
        if self.profiles.contains_key(&call_id) {
            return Err(Error::invariant(format!(
                "voice profile already exists for call {}",
                call_id
            )));
        }
        self.profiles.insert(call_id, Arc::new(embedding));
        tracing::debug!(call_id = %call_id, "Voice profile created");
        Ok(())
    }

    pub fn get(&self, call_id: CallId) -> Option<Arc<Vec<f32>>> {
        self.profiles.get(&call_id).map(|e| e.clone())
    }

    pub fn exists(&self, call_id: CallId) -> bool {
        self.profiles.contains_key(&call_id)
    }

    /// Remove the profile at session close; idempotent
    pub fn remove(&self, call_id: CallId) {
        self.profiles.remove(&call_id);
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}
