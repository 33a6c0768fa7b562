//! Canonical metadata document
//!
//! One per recording. Parse/serialize is identity on canonical fields; the
//! intent/entity/topic blocks are filled by the offline worker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use callweave_core::{CallId, OrgId, RecordingId};

/// How the current transcription/sentiment blocks were produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingMode {
    #[default]
    Online,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioDescriptor {
    /// Container format, e.g. "wav"
    pub format: String,
    pub sample_rate: u32,
    pub duration_seconds: f64,
    pub file_size_bytes: u64,
    pub checksum_sha256: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionBlock {
    pub text: String,
    pub corrected_text: String,
    pub language: String,
    pub confidence: f32,
    /// (original, corrected) pairs
    pub corrections_made: Vec<(String, String)>,
    /// "online" or "offline"
    pub correction_method: ProcessingMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentimentBlock {
    pub label: String,
    pub score: f32,
    pub confidence: f32,
    pub emotional_tone: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentBlock {
    pub primary_intent: String,
    pub secondary_intents: Vec<String>,
    pub confidence: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityBlock {
    pub account_numbers: Vec<String>,
    pub amounts: Vec<String>,
    pub emails: Vec<String>,
    pub phones: Vec<String>,
    pub dates: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicBlock {
    pub topics: Vec<String>,
    pub keywords: Vec<String>,
    pub coherence_score: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnSummary {
    pub role: String,
    pub text: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub stt_confidence: f32,
    pub was_interrupted: bool,
}

/// Per-stage latency averages across the call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingMetrics {
    pub stt_ms_avg: Option<f64>,
    pub llm_ms_avg: Option<f64>,
    pub tts_ms_avg: Option<f64>,
    pub denoise_ms_avg: Option<f64>,
    pub total_ms_avg: Option<f64>,
}

/// The canonical metadata document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub recording_id: RecordingId,
    pub conversation_id: CallId,
    pub org_id: OrgId,
    pub timestamp: DateTime<Utc>,
    /// "inbound" or "outbound"
    pub direction: String,
    pub audio: AudioDescriptor,
    pub transcription: TranscriptionBlock,
    pub sentiment: SentimentBlock,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent: Option<IntentBlock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entities: Option<EntityBlock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topics: Option<TopicBlock>,
    pub turns: Vec<TurnSummary>,
    pub processing_metrics: ProcessingMetrics,
    pub processed: bool,
    pub processing_mode: ProcessingMode,
}

impl Metadata {
    pub fn to_json(&self) -> Result<Vec<u8>, crate::StorageError> {
        serde_json::to_vec_pretty(self).map_err(|e| crate::StorageError::Encode(e.to_string()))
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, crate::StorageError> {
        serde_json::from_slice(bytes).map_err(|e| crate::StorageError::Encode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sample_metadata() -> Metadata {
        Metadata {
            recording_id: RecordingId::new(),
            conversation_id: CallId::new(),
            org_id: OrgId::new(),
            timestamp: Utc::now(),
            direction: "inbound".to_string(),
            audio: AudioDescriptor {
                format: "wav".to_string(),
                sample_rate: 16000,
                duration_seconds: 2.5,
                file_size_bytes: 80044,
                checksum_sha256: "ab".repeat(32),
            },
            transcription: TranscriptionBlock {
                text: "Necesito revisar el salgo de mi cuesta".to_string(),
                corrected_text: "Necesito revisar el saldo de mi cuenta".to_string(),
                language: "es".to_string(),
                confidence: 0.91,
                corrections_made: vec![
                    ("salgo".to_string(), "saldo".to_string()),
                    ("cuesta".to_string(), "cuenta".to_string()),
                ],
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
            turns: vec![TurnSummary {
                role: "user".to_string(),
                text: "Necesito revisar el saldo de mi cuenta".to_string(),
                started_at: Utc::now(),
                ended_at: None,
                stt_confidence: 0.91,
                was_interrupted: false,
            }],
            processing_metrics: ProcessingMetrics {
                stt_ms_avg: Some(820.0),
                ..Default::default()
            },
            processed: false,
            processing_mode: ProcessingMode::Online,
        }
    }

    #[test]
    fn test_round_trip_identity() {
        let metadata = sample_metadata();
        let bytes = metadata.to_json().unwrap();
        let parsed = Metadata::from_json(&bytes).unwrap();
        assert_eq!(metadata, parsed);
    }

    #[test]
    fn test_optional_blocks_omitted() {
        let metadata = sample_metadata();
        let json = String::from_utf8(metadata.to_json().unwrap()).unwrap();
        assert!(!json.contains("\"intent\""));
        assert!(!json.contains("\"topics\""));
    }

    #[test]
    fn test_processing_mode_wire_form() {
        let json = serde_json::to_string(&ProcessingMode::Offline).unwrap();
        assert_eq!(json, "\"offline\"");
    }
}
