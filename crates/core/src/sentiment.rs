//! Sentiment and prosody types
//!
//! Prosody features come back from the external analyzer; the fuser
//! combines them with lexical sentiment into a single labeled score.

use serde::{Deserialize, Serialize};

/// Emotional tone reported by the prosody analyzer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EmotionalTone {
    #[default]
    Neutral,
    Nervous,
    Excited,
    Calm,
    Concerned,
}

/// Prosody analysis output for one segment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ProsodyFeatures {
    /// Rising pitch toward the end of the segment
    pub pitch_rise: bool,
    pub pause_duration_ms: u64,
    /// Syllables per second estimate
    pub speech_rate: f32,
    pub emotional_tone: EmotionalTone,
    pub is_question: bool,
    pub has_speech: bool,
}

/// Fused sentiment label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SentimentLabel {
    Positive,
    #[default]
    Neutral,
    Frustrated,
    Angry,
    Confused,
}

impl SentimentLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SentimentLabel::Positive => "positive",
            SentimentLabel::Neutral => "neutral",
            SentimentLabel::Frustrated => "frustrated",
            SentimentLabel::Angry => "angry",
            SentimentLabel::Confused => "confused",
        }
    }

    /// Labels that may fire a sentiment alert
    pub fn is_alerting(&self) -> bool {
        matches!(self, SentimentLabel::Frustrated | SentimentLabel::Angry)
    }
}

/// Result of fusing lexical sentiment with prosody
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedSentiment {
    pub label: SentimentLabel,
    /// Score in [-1, 1]
    pub score: f32,
    /// Confidence in [0, 1]
    pub confidence: f32,
    pub emotional_tone: EmotionalTone,
}

impl Default for FusedSentiment {
    fn default() -> Self {
        Self {
            label: SentimentLabel::Neutral,
            score: 0.0,
            confidence: 0.0,
            emotional_tone: EmotionalTone::Neutral,
        }
    }
}

/// Conversation-context flags computed over recent user turns
///
/// Produced by the sentiment/context fuser; consumed by the turn controller
/// and the dialogue prompt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextFlags {
    /// Jaccard overlap > 0.6 with an earlier question in the window
    pub repeated_question: bool,
    /// Frustration keywords accumulated over the last turns
    pub user_frustrated: bool,
    /// Explicit request for a human agent
    pub escalation_request: bool,
    /// Repeated wh-questions in the window
    pub confused: bool,
}

impl ContextFlags {
    pub fn any(&self) -> bool {
        self.repeated_question || self.user_frustrated || self.escalation_request || self.confused
    }
}
