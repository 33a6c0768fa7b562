//! Streaming frame abstraction
//!
//! The dialogue → speech path is a chain of `FrameProcessor`s connected by
//! channels. Frames are finite, non-restartable, and carry explicit
//! control/cancellation markers.

use async_trait::async_trait;

use crate::audio::AudioFrame;
use crate::error::Result;
use crate::ids::CallId;

/// Control frames injected between data frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFrame {
    /// Flush any buffered partial output downstream
    Flush,
    /// Drop all buffered state and start fresh
    Reset,
}

/// One unit flowing through a processor chain
#[derive(Debug, Clone)]
pub enum Frame {
    /// A streamed dialogue-engine text delta
    LlmChunk { text: String, is_final: bool },
    /// A complete sentence ready for synthesis
    Sentence { text: String, index: usize },
    /// Synthesized audio on its way to playback
    AudioOutput {
        frame: AudioFrame,
        /// Sequence within the current synthesis
        chunk_seq: u64,
        /// Generation of the synthesis; stale generations are discarded
        generation: u64,
    },
    /// The user started speaking while the assistant was
    BargeIn { played_until_ms: u64 },
    /// Inbound voice activity markers
    VoiceStart,
    VoiceEnd { duration_ms: u64 },
    Control(ControlFrame),
    /// A stage failed; recoverable errors degrade, others end the stream
    Error {
        stage: String,
        message: String,
        recoverable: bool,
    },
    EndOfStream,
}

impl Frame {
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, Frame::EndOfStream)
    }
}

/// Mutable context threaded through a chain run
#[derive(Debug, Clone, Default)]
pub struct ProcessorContext {
    pub call_id: Option<CallId>,
    /// BCP-47 language of the conversation, e.g. "es"
    pub language: String,
}

impl ProcessorContext {
    pub fn new(call_id: CallId) -> Self {
        Self {
            call_id: Some(call_id),
            language: "es".to_string(),
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }
}

/// A stage in a streaming chain
///
/// Implementations are shared behind `Arc` and must be internally
/// synchronized; `process` may fan one frame out into several.
#[async_trait]
pub trait FrameProcessor: Send + Sync {
    async fn process(&self, frame: Frame, context: &mut ProcessorContext) -> Result<Vec<Frame>>;

    fn name(&self) -> &'static str;

    async fn on_start(&self, _context: &mut ProcessorContext) -> Result<()> {
        Ok(())
    }

    async fn on_stop(&self, _context: &mut ProcessorContext) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_end_of_stream_marker() {
        assert!(Frame::EndOfStream.is_end_of_stream());
        assert!(!Frame::VoiceStart.is_end_of_stream());
    }

    #[test]
    fn test_context_defaults_to_spanish() {
        let ctx = ProcessorContext::new(CallId::new());
        assert_eq!(ctx.language, "es");
    }
}
