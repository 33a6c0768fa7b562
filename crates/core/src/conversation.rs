//! Conversation types: calls, turns, transcripts
//!
//! Turns are append-only within a call. The rolling transcript keeps
//! per-word confidences so the corrector and clarifier can gate on them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Call lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Active,
    Ended,
    Error,
}

/// Outcome reported when a call is closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallOutcome {
    /// Normal hangup
    Completed,
    /// Transferred to a human agent
    Transferred,
    /// The bridge dropped the stream
    BridgeClosed,
    /// An internal invariant was violated
    Failed,
}

impl CallOutcome {
    pub fn final_status(self) -> CallStatus {
        match self {
            CallOutcome::Failed => CallStatus::Error,
            _ => CallStatus::Ended,
        }
    }
}

/// Speaker role within a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    User,
    Assistant,
}

/// One word with its recognition confidence and timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WordConfidence {
    pub word: String,
    pub confidence: f32,
    /// Offset from segment start, seconds
    pub start: f32,
    pub end: f32,
}

/// Per-stage latencies recorded for a turn; None when the stage was skipped
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnLatencies {
    pub stt_ms: Option<u64>,
    pub llm_ms: Option<u64>,
    pub tts_ms: Option<u64>,
    pub denoise_ms: Option<u64>,
    pub total_ms: Option<u64>,
}

/// One speaker round within a call, append-only
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: TurnRole,
    pub text: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub stt_confidence: f32,
    /// (original, corrected) pairs applied by the online corrector
    pub corrections: Vec<(String, String)>,
    pub sentiment_label: Option<String>,
    pub sentiment_score: Option<f32>,
    pub latencies: TurnLatencies,
    pub was_interrupted: bool,
}

impl Turn {
    pub fn user(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            role: TurnRole::User,
            text: text.into(),
            started_at: Utc::now(),
            ended_at: None,
            stt_confidence: confidence,
            corrections: Vec::new(),
            sentiment_label: None,
            sentiment_score: None,
            latencies: TurnLatencies::default(),
            was_interrupted: false,
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Assistant,
            text: text.into(),
            started_at: Utc::now(),
            ended_at: None,
            stt_confidence: 1.0,
            corrections: Vec::new(),
            sentiment_label: None,
            sentiment_score: None,
            latencies: TurnLatencies::default(),
            was_interrupted: false,
        }
    }
}

/// Rolling transcript with word confidences
///
/// Invariant: the concatenation of the word texts equals the transcript
/// text, whitespace-normalized.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    pub text: String,
    pub words: Vec<WordConfidence>,
}

impl Transcript {
    pub fn new(text: impl Into<String>, words: Vec<WordConfidence>) -> Self {
        Self {
            text: text.into(),
            words,
        }
    }

    /// Mean word confidence; 0 when empty
    pub fn confidence_avg(&self) -> f32 {
        if self.words.is_empty() {
            return 0.0;
        }
        self.words.iter().map(|w| w.confidence).sum::<f32>() / self.words.len() as f32
    }

    /// Verify the word/text consistency invariant
    pub fn is_consistent(&self) -> bool {
        let joined = self
            .words
            .iter()
            .map(|w| w.word.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        normalize_whitespace(&joined) == normalize_whitespace(&self.text)
    }
}

/// Collapse runs of whitespace and trim
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
