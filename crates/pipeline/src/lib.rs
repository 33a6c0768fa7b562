//! Per-call audio pipeline components
//!
//! Ingress framing and segmentation, the preprocessor gateway, the
//! voice-profile store, the STT adapter, the TTS streamer, the playback
//! controller, the turn state machine, and the streaming processor chain
//! that connects dialogue output to synthesis.

pub mod bus;
pub mod ingress;
pub mod playback;
pub mod preprocess;
pub mod processors;
pub mod profile;
pub mod stt;
pub mod tts;
pub mod turn;

pub use bus::{SessionBus, SessionSignal};
pub use ingress::{AudioIngress, IngressConfig, IngressEvent, Segment};
pub use playback::PlaybackController;
pub use preprocess::{
    HttpDenoiser, HttpProsodyAnalyzer, HttpSpeakerExtractor, PreprocessOutcome,
    PreprocessorGateway,
};
pub use profile::VoiceProfileStore;
pub use stt::{HttpSttService, SttAdapter, SttQueue, SttSubmit};
pub use tts::{HttpTtsService, TtsStreamer};
pub use turn::{TurnController, TurnPhase, TurnUpdate, VoiceActivity};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("overloaded: {0}")]
    Overloaded(&'static str),

    #[error("invalid turn transition: {0}")]
    InvalidTransition(String),
}

impl From<PipelineError> for callweave_core::Error {
    fn from(e: PipelineError) -> Self {
        match e {
            PipelineError::Overloaded(what) => {
                callweave_core::Error::Overloaded(what.to_string())
            }
            PipelineError::InvalidTransition(msg) => callweave_core::Error::invariant(msg),
        }
    }
}
