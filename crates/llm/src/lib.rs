//! Dialogue engine adapter
//!
//! Streams a long-lived chat request to the dialogue service and surfaces
//! text deltas and tool invocations as they arrive. Prompt assembly keeps
//! the conversation memory bounded.

mod backend;
mod prompt;

pub use backend::{DialogueBackend, DialogueConfig};
pub use prompt::{ConversationMemory, PromptAssembler};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("configuration: {0}")]
    Configuration(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("stream decode failed: {0}")]
    Decode(String),

    #[error("cancelled")]
    Cancelled,
}

impl From<LlmError> for callweave_core::Error {
    fn from(e: LlmError) -> Self {
        match e {
            LlmError::Cancelled => callweave_core::Error::dependency("llm", "cancelled"),
            other => callweave_core::Error::dependency("llm", other),
        }
    }
}
