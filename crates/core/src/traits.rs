//! Traits for pluggable external services
//!
//! Every model server (STT, TTS, dialogue, denoise, extraction, prosody) is
//! an HTTP contract behind one of these seams. Adapters live in the
//! pipeline/llm crates; tests substitute in-memory fakes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::audio::AudioFrame;
use crate::conversation::WordConfidence;
use crate::error::Result;
use crate::sentiment::ProsodyFeatures;

/// Transcription output for one segment
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TranscriptionResult {
    pub text: String,
    /// Text after service-side correction, when the service applied any
    pub corrected_text: Option<String>,
    pub language: String,
    pub confidence: f32,
    /// Segment-level spans as (start, end, text)
    pub segments: Vec<(f32, f32, String)>,
    pub words: Vec<WordConfidence>,
}

/// Speech-to-text service seam
#[async_trait]
pub trait SpeechToText: Send + Sync {
    /// Transcribe one bounded segment of 16 kHz mono samples.
    ///
    /// `params` are forwarded opaquely from session configuration.
    async fn transcribe(&self, samples: &[f32], params: &Value) -> Result<TranscriptionResult>;

    /// Teach the service a correction pair so future transcriptions apply it
    async fn learn_correction(&self, original: &str, corrected: &str) -> Result<()>;
}

/// One synthesized audio chunk
#[derive(Debug, Clone)]
pub struct TtsChunk {
    pub audio: AudioFrame,
    /// Sequence within the synthesis request
    pub seq: u64,
    pub is_final: bool,
}

/// Text-to-speech service seam
///
/// Chunks are pushed to `tx` as they arrive; dropping the receiver cancels
/// the synthesis.
#[async_trait]
pub trait TextToSpeech: Send + Sync {
    async fn synthesize(
        &self,
        text: &str,
        voice_profile_id: Option<&str>,
        tx: mpsc::Sender<TtsChunk>,
    ) -> Result<()>;
}

/// Denoise service seam (bytes in, bytes out)
#[async_trait]
pub trait Denoiser: Send + Sync {
    async fn denoise(&self, samples: &[f32]) -> Result<Vec<f32>>;
}

/// Target-speaker extraction service seam
#[async_trait]
pub trait SpeakerExtractor: Send + Sync {
    /// Isolate the target voice given an existing embedding
    async fn extract(&self, samples: &[f32], embedding: &[f32]) -> Result<Vec<f32>>;

    /// Build a speaker embedding from clean speech
    async fn create_embedding(&self, samples: &[f32]) -> Result<Vec<f32>>;
}

/// Prosody analysis service seam
#[async_trait]
pub trait ProsodyAnalyzer: Send + Sync {
    async fn analyze(&self, samples: &[f32]) -> Result<ProsodyFeatures>;
}

/// A message in the dialogue memory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryMessage {
    /// "user" or "assistant"
    pub role: String,
    pub content: String,
}

/// Request to the dialogue engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialogueRequest {
    pub conversation_id: String,
    pub system: String,
    pub memory: Vec<MemoryMessage>,
    pub user: String,
    /// Tool catalog forwarded to the engine
    pub tools: Vec<Value>,
}

/// Streamed dialogue engine events
#[derive(Debug, Clone)]
pub enum DialogueEvent {
    /// A text delta
    Text { delta: String },
    /// A tool invocation request
    ToolCall { name: String, arguments: Value },
    /// Stream completed; usage is engine-specific
    Done { usage: Option<Value> },
}

/// Dialogue engine seam; events arrive on `tx` until Done or cancellation
#[async_trait]
pub trait DialogueStream: Send + Sync {
    async fn chat_stream(
        &self,
        request: DialogueRequest,
        tx: mpsc::Sender<DialogueEvent>,
    ) -> Result<()>;

    /// Push a tool result back into the engine's protocol mid-stream
    async fn submit_tool_result(&self, conversation_id: &str, name: &str, result: Value)
        -> Result<()>;
}

/// Clarification strategies the online corrector may choose
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClarificationStrategy {
    ExplicitConfirmation,
    FullRepeat,
    ImplicitClarification,
    SpellOut,
}

/// A request to clarify a low-confidence critical word instead of
/// committing the turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClarificationRequest {
    pub strategy: ClarificationStrategy,
    /// The token that triggered clarification
    pub word: String,
    /// Category it matched, e.g. "destructive_actions"
    pub category: String,
    /// Template-filled prompt to synthesize
    pub prompt: String,
}
