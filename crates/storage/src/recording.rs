//! Recording store
//!
//! Writes the audio blob first and the metadata document after it; a
//! recording is visible only when both exist and the audio checksum
//! matches. Any failure deletes both halves. In dual-write mode the remote
//! mirror is best-effort with bounded retries off the hot path.

use sha2::{Digest, Sha256};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use callweave_core::{OrgId, RecordingId, SampleRate};

use crate::metadata::Metadata;
use crate::remote::BlobStore;
use crate::StorageError;

const REMOTE_RETRIES: u32 = 3;

/// A visible recording
#[derive(Debug, Clone)]
pub struct StoredRecording {
    pub metadata: Metadata,
    pub audio_path: PathBuf,
}

/// Filesystem-backed store, optionally mirrored to an object store
pub struct RecordingStore {
    root: PathBuf,
    remote: Option<Arc<dyn BlobStore>>,
}

impl RecordingStore {
    pub fn new(root: impl Into<PathBuf>, remote: Option<Arc<dyn BlobStore>>) -> Self {
        Self {
            root: root.into(),
            remote,
        }
    }

    fn audio_rel(metadata: &Metadata) -> String {
        format!(
            "recordings/{}/{}.wav",
            metadata.conversation_id, metadata.recording_id
        )
    }

    fn metadata_rel(metadata: &Metadata) -> String {
        format!(
            "recordings/{}/{}_metadata.json",
            metadata.conversation_id, metadata.recording_id
        )
    }

    fn transcript_rel(metadata: &Metadata) -> String {
        format!(
            "transcripts/{}/{}_transcript.json",
            metadata.conversation_id, metadata.recording_id
        )
    }

    fn abs(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    /// Encode 16 kHz mono samples as WAV bytes
    fn encode_wav(samples: &[f32]) -> Result<Vec<u8>, StorageError> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: SampleRate::Hz16000.as_u32(),
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };

        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec)
                .map_err(|e| StorageError::Encode(e.to_string()))?;
            for &sample in samples {
                let pcm = (sample.clamp(-1.0, 1.0) * 32767.0) as i16;
                writer
                    .write_sample(pcm)
                    .map_err(|e| StorageError::Encode(e.to_string()))?;
            }
            writer
                .finalize()
                .map_err(|e| StorageError::Encode(e.to_string()))?;
        }
        Ok(cursor.into_inner())
    }

    fn sha256_hex(bytes: &[u8]) -> String {
        let digest = Sha256::digest(bytes);
        let mut out = String::with_capacity(64);
        for byte in digest {
            out.push_str(&format!("{:02x}", byte));
        }
        out
    }

    /// Persist one recording: audio, then transcript, then metadata.
    ///
    /// The audio descriptor (size, duration, checksum) is computed here; the
    /// caller supplies the rest of the document.
    pub async fn store(
        &self,
        samples: &[f32],
        mut metadata: Metadata,
        transcript: &serde_json::Value,
    ) -> Result<StoredRecording, StorageError> {
        let wav = Self::encode_wav(samples)?;
        metadata.audio.format = "wav".to_string();
        metadata.audio.sample_rate = SampleRate::Hz16000.as_u32();
        metadata.audio.duration_seconds =
            samples.len() as f64 / SampleRate::Hz16000.as_u32() as f64;
        metadata.audio.file_size_bytes = wav.len() as u64;
        metadata.audio.checksum_sha256 = Self::sha256_hex(&wav);

        let audio_rel = Self::audio_rel(&metadata);
        let metadata_rel = Self::metadata_rel(&metadata);
        let transcript_rel = Self::transcript_rel(&metadata);

        if let Err(e) = self
            .write_all(&metadata, &wav, transcript, &audio_rel, &metadata_rel, &transcript_rel)
            .await
        {
            // Either write failed: neither half may remain readable
            self.delete_local(&[&audio_rel, &metadata_rel, &transcript_rel])
                .await;
            return Err(e);
        }

        if let Some(remote) = &self.remote {
            let remote = remote.clone();
            let metadata_bytes = metadata.to_json()?;
            let transcript_bytes = serde_json::to_vec(transcript)
                .map_err(|e| StorageError::Encode(e.to_string()))?;
            let audio_rel = audio_rel.clone();
            let metadata_rel = metadata_rel.clone();
            let transcript_rel = transcript_rel.clone();

            // Best-effort mirror with retry, off the hot path
            tokio::spawn(async move {
                for (rel, bytes) in [
                    (audio_rel, wav),
                    (transcript_rel, transcript_bytes),
                    (metadata_rel, metadata_bytes),
                ] {
                    let mut delay = Duration::from_millis(200);
                    for attempt in 1..=REMOTE_RETRIES {
                        match remote.put(&rel, &bytes).await {
                            Ok(()) => break,
                            Err(e) if attempt == REMOTE_RETRIES => {
                                tracing::warn!(path = %rel, error = %e, "Remote mirror failed");
                            }
                            Err(_) => {
                                tokio::time::sleep(delay).await;
                                delay *= 2;
                            }
                        }
                    }
                }
            });
        }

        Ok(StoredRecording {
            audio_path: self.abs(&audio_rel),
            metadata,
        })
    }

    async fn write_all(
        &self,
        metadata: &Metadata,
        wav: &[u8],
        transcript: &serde_json::Value,
        audio_rel: &str,
        metadata_rel: &str,
        transcript_rel: &str,
    ) -> Result<(), StorageError> {
        let audio_path = self.abs(audio_rel);
        let metadata_path = self.abs(metadata_rel);
        let transcript_path = self.abs(transcript_rel);

        for path in [&audio_path, &metadata_path, &transcript_path] {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        // Audio first; the metadata write is what makes the recording visible
        tokio::fs::write(&audio_path, wav).await?;

        let transcript_bytes =
            serde_json::to_vec_pretty(transcript).map_err(|e| StorageError::Encode(e.to_string()))?;
        tokio::fs::write(&transcript_path, transcript_bytes).await?;

        tokio::fs::write(&metadata_path, metadata.to_json()?).await?;
        Ok(())
    }

    async fn delete_local(&self, rels: &[&str]) {
        for rel in rels {
            let _ = tokio::fs::remove_file(self.abs(rel)).await;
        }
    }

    /// Check the both-halves-and-checksum visibility rule
    async fn is_visible(&self, metadata: &Metadata) -> bool {
        let audio_path = self.abs(&Self::audio_rel(metadata));
        match tokio::fs::read(&audio_path).await {
            Ok(bytes) => Self::sha256_hex(&bytes) == metadata.audio.checksum_sha256,
            Err(_) => false,
        }
    }

    async fn read_metadata(&self, path: &Path) -> Option<Metadata> {
        let bytes = tokio::fs::read(path).await.ok()?;
        Metadata::from_json(&bytes).ok()
    }

    /// Walk every metadata document on disk
    async fn walk_metadata(&self) -> Vec<(PathBuf, Metadata)> {
        let mut found = Vec::new();
        let recordings_root = self.root.join("recordings");
        let Ok(mut conversations) = tokio::fs::read_dir(&recordings_root).await else {
            return found;
        };

        while let Ok(Some(conv)) = conversations.next_entry().await {
            let Ok(mut entries) = tokio::fs::read_dir(conv.path()).await else {
                continue;
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                let is_metadata = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.ends_with("_metadata.json"))
                    .unwrap_or(false);
                if is_metadata {
                    if let Some(metadata) = self.read_metadata(&path).await {
                        found.push((path, metadata));
                    }
                }
            }
        }
        found
    }

    /// Unprocessed, visible recordings for one org
    pub async fn list_unprocessed(
        &self,
        org_id: OrgId,
        limit: usize,
    ) -> Result<Vec<Metadata>, StorageError> {
        let mut out = Vec::new();
        for (_, metadata) in self.walk_metadata().await {
            if metadata.org_id != org_id || metadata.processed {
                continue;
            }
            if self.is_visible(&metadata).await {
                out.push(metadata);
                if out.len() >= limit {
                    break;
                }
            }
        }
        Ok(out)
    }

    /// Fetch one visible recording, org-scoped. Cross-tenant ids are
    /// indistinguishable from missing ones.
    pub async fn get(
        &self,
        org_id: OrgId,
        recording_id: RecordingId,
    ) -> Result<StoredRecording, StorageError> {
        for (_, metadata) in self.walk_metadata().await {
            if metadata.recording_id != recording_id {
                continue;
            }
            if metadata.org_id != org_id {
                return Err(StorageError::NotFound);
            }
            if !self.is_visible(&metadata).await {
                return Err(StorageError::NotFound);
            }
            let audio_path = self.abs(&Self::audio_rel(&metadata));
            return Ok(StoredRecording {
                audio_path,
                metadata,
            });
        }
        Err(StorageError::NotFound)
    }

    /// Replace a recording's metadata in place (offline worker contract)
    pub async fn replace_metadata(
        &self,
        org_id: OrgId,
        recording_id: RecordingId,
        new_metadata: Metadata,
    ) -> Result<(), StorageError> {
        let existing = self.get(org_id, recording_id).await?;

        if new_metadata.recording_id != recording_id
            || new_metadata.conversation_id != existing.metadata.conversation_id
            || new_metadata.org_id != org_id
        {
            return Err(StorageError::Encode(
                "metadata identity fields may not change".to_string(),
            ));
        }

        let rel = Self::metadata_rel(&new_metadata);
        tokio::fs::write(self.abs(&rel), new_metadata.to_json()?).await?;

        if let Some(remote) = &self.remote {
            let remote = remote.clone();
            let bytes = new_metadata.to_json()?;
            tokio::spawn(async move {
                if let Err(e) = remote.put(&rel, &bytes).await {
                    tracing::warn!(path = %rel, error = %e, "Remote metadata update failed");
                }
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{
        AudioDescriptor, ProcessingMode, SentimentBlock, TranscriptionBlock,
    };
    use chrono::Utc;

    fn draft_metadata(org: OrgId) -> Metadata {
        Metadata {
            recording_id: RecordingId::new(),
            conversation_id: callweave_core::CallId::new(),
            org_id: org,
            timestamp: Utc::now(),
            direction: "inbound".to_string(),
            audio: AudioDescriptor {
                format: String::new(),
                sample_rate: 0,
                duration_seconds: 0.0,
                file_size_bytes: 0,
                checksum_sha256: String::new(),
            },
            transcription: TranscriptionBlock {
                text: "hola".to_string(),
                corrected_text: "hola".to_string(),
                language: "es".to_string(),
                confidence: 0.9,
                corrections_made: vec![],
                correction_method: ProcessingMode::Online,
            },
            sentiment: SentimentBlock {
                label: "neutral".to_string(),
                score: 0.0,
                confidence: 0.5,
                emotional_tone: "neutral".to_string(),
            },
            intent: None,
            entities: None,
            topics: None,
            turns: vec![],
            processing_metrics: Default::default(),
            processed: false,
            processing_mode: ProcessingMode::Online,
        }
    }

    fn store_in(dir: &tempfile::TempDir) -> RecordingStore {
        RecordingStore::new(dir.path(), None)
    }

    #[tokio::test]
    async fn test_store_and_get() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let org = OrgId::new();

        let stored = store
            .store(&vec![0.1; 16000], draft_metadata(org), &serde_json::json!({"turns": []}))
            .await
            .unwrap();

        assert_eq!(stored.metadata.audio.sample_rate, 16000);
        assert!((stored.metadata.audio.duration_seconds - 1.0).abs() < 1e-9);
        assert_eq!(stored.metadata.audio.checksum_sha256.len(), 64);
        assert!(stored.audio_path.exists());

        let fetched = store.get(org, stored.metadata.recording_id).await.unwrap();
        assert_eq!(fetched.metadata, stored.metadata);
    }

    #[tokio::test]
    async fn test_cross_tenant_get_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let org_a = OrgId::new();
        let org_b = OrgId::new();

        let stored = store
            .store(&vec![0.1; 1600], draft_metadata(org_a), &serde_json::json!({}))
            .await
            .unwrap();

        let err = store.get(org_b, stored.metadata.recording_id).await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound));
    }

    #[tokio::test]
    async fn test_corrupted_audio_is_invisible() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let org = OrgId::new();

        let stored = store
            .store(&vec![0.1; 1600], draft_metadata(org), &serde_json::json!({}))
            .await
            .unwrap();

        // Corrupt the audio blob: checksum no longer matches
        tokio::fs::write(&stored.audio_path, b"garbage").await.unwrap();

        let err = store.get(org, stored.metadata.recording_id).await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound));
        assert!(store.list_unprocessed(org, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_unprocessed_filters() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let org = OrgId::new();

        let first = store
            .store(&vec![0.1; 1600], draft_metadata(org), &serde_json::json!({}))
            .await
            .unwrap();
        let mut processed = draft_metadata(org);
        processed.processed = true;
        store
            .store(&vec![0.1; 1600], processed, &serde_json::json!({}))
            .await
            .unwrap();
        // Different org
        store
            .store(&vec![0.1; 1600], draft_metadata(OrgId::new()), &serde_json::json!({}))
            .await
            .unwrap();

        let unprocessed = store.list_unprocessed(org, 10).await.unwrap();
        assert_eq!(unprocessed.len(), 1);
        assert_eq!(unprocessed[0].recording_id, first.metadata.recording_id);
    }

    #[tokio::test]
    async fn test_replace_metadata_marks_processed() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let org = OrgId::new();

        let stored = store
            .store(&vec![0.1; 1600], draft_metadata(org), &serde_json::json!({}))
            .await
            .unwrap();

        let mut enriched = stored.metadata.clone();
        enriched.processed = true;
        enriched.processing_mode = ProcessingMode::Offline;
        store
            .replace_metadata(org, stored.metadata.recording_id, enriched)
            .await
            .unwrap();

        let fetched = store.get(org, stored.metadata.recording_id).await.unwrap();
        assert!(fetched.metadata.processed);
        assert_eq!(fetched.metadata.processing_mode, ProcessingMode::Offline);
        assert!(store.list_unprocessed(org, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_replace_metadata_rejects_identity_change() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let org = OrgId::new();

        let stored = store
            .store(&vec![0.1; 1600], draft_metadata(org), &serde_json::json!({}))
            .await
            .unwrap();

        let mut tampered = stored.metadata.clone();
        tampered.org_id = OrgId::new();
        let err = store
            .replace_metadata(org, stored.metadata.recording_id, tampered)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Encode(_)));
    }
}
