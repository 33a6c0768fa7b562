//! Core traits and types for the call orchestrator
//!
//! This crate provides foundational types used across all other crates:
//! - Audio frame types and buffering
//! - Frame/processor abstractions for the streaming pipeline
//! - Conversation types (calls, turns, word confidences)
//! - Sentiment and prosody types
//! - Lifecycle events and the webhook envelope
//! - The error taxonomy shared by every component
//! - Traits for pluggable external services (STT, TTS, dialogue, preprocessing)

pub mod audio;
pub mod conversation;
pub mod error;
pub mod events;
pub mod frame;
pub mod ids;
pub mod sentiment;
pub mod traits;

pub use audio::{AudioBuffer, AudioFrame, SampleRate, FRAME_MS};
pub use conversation::{
    normalize_whitespace, CallOutcome, CallStatus, Transcript, Turn, TurnLatencies, TurnRole,
    WordConfidence,
};
pub use error::{Error, ErrorKind, Result};
pub use events::{CallEvent, EventEnvelope, WebhookEvent};
pub use frame::{ControlFrame, Frame, FrameProcessor, ProcessorContext};
pub use ids::{AgentId, CallId, OrgId, RecordingId, TokenId, WebhookId};
pub use sentiment::{
    ContextFlags, EmotionalTone, FusedSentiment, ProsodyFeatures, SentimentLabel,
};
pub use traits::{
    ClarificationRequest, ClarificationStrategy, Denoiser, DialogueEvent, DialogueRequest,
    DialogueStream, ProsodyAnalyzer, SpeakerExtractor, SpeechToText, TextToSpeech,
    TranscriptionResult, TtsChunk,
};
