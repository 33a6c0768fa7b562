//! Streaming processor chain
//!
//! Connects the dialogue stream to synthesis: the sentence detector turns
//! token deltas into sentence chunks, the interrupt handler gates frames
//! after a barge-in so cancelled output never reaches playback.

mod chain;
mod interrupt_handler;
mod sentence_detector;

pub use chain::ProcessorChain;
pub use interrupt_handler::{InterruptHandler, InterruptHandlerConfig};
pub use sentence_detector::{SentenceDetector, SentenceDetectorConfig};
