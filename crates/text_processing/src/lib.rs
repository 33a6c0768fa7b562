//! Text processing for the live call path
//!
//! Two online mechanisms run under a hard latency budget: exact dictionary
//! correction and critical-word clarification. Sentiment fusion and context
//! detection feed the turn controller and dialogue engine.

pub mod clarify;
pub mod context;
pub mod corrector;
pub mod sentiment;

pub use clarify::{ClarificationOutcome, Clarifier, CriticalCategories};
pub use context::{ContextDetector, ContextFlags};
pub use corrector::{CorrectionDictionary, CorrectionResult, OnlineCorrector};
pub use sentiment::{SentimentFuser, SentimentLexicon};
