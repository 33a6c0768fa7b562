//! Turn controller
//!
//! Per-session state machine deciding when the user's turn has ended and
//! when the assistant may speak. Silence-driven transitions run off the
//! ingress silence clock; the remaining transitions are explicit calls from
//! the session runner. Any transition outside the table is an invariant
//! violation.

use parking_lot::Mutex;

use callweave_core::ProsodyFeatures;

use crate::PipelineError;

/// Turn phases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TurnPhase {
    /// Waiting for the user to speak
    #[default]
    Listening,
    /// User is speaking (or briefly pausing)
    UserTurn,
    /// User paused mid-thought; wait without dispatching STT
    ThinkingPause,
    /// A clarification prompt is being spoken; user text is not committed
    Clarifying,
    /// Assistant is responding
    AssistantTurn,
    /// Assistant was interrupted; cancellation in progress
    Interrupted,
    /// Bridge closed
    Ended,
}

/// Voice activity as seen by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceActivity {
    Speech,
    Silence,
}

/// Timing configuration
#[derive(Debug, Clone)]
pub struct TurnConfig {
    pub end_of_turn_pause_ms: u64,
    /// Shortened threshold when prosody marks the utterance a question
    pub end_of_turn_pause_question_ms: u64,
    pub thinking_pause_min_ms: u64,
    pub thinking_pause_max_ms: u64,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            end_of_turn_pause_ms: 1500,
            end_of_turn_pause_question_ms: 600,
            thinking_pause_min_ms: 800,
            thinking_pause_max_ms: 2500,
        }
    }
}

/// Result of feeding activity into the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnUpdate {
    pub phase: TurnPhase,
    /// True exactly once per turn, when the end-of-turn pause is reached
    pub end_of_turn: bool,
}

#[derive(Debug)]
struct Inner {
    phase: TurnPhase,
    /// Latest prosody seen this turn
    is_question: bool,
    thinking_heuristic: bool,
    /// end-of-turn already fired for this turn
    dispatched: bool,
}

/// Per-session turn controller
pub struct TurnController {
    config: TurnConfig,
    inner: Mutex<Inner>,
}

impl TurnController {
    pub fn new(config: TurnConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                phase: TurnPhase::Listening,
                is_question: false,
                thinking_heuristic: false,
                dispatched: false,
            }),
        }
    }

    pub fn phase(&self) -> TurnPhase {
        self.inner.lock().phase
    }

    /// Update the prosody-derived hints for the current turn
    pub fn update_prosody(&self, prosody: &ProsodyFeatures) {
        let mut inner = self.inner.lock();
        inner.is_question = prosody.is_question;
        // A flat, unfinished contour suggests the user is mid-thought
        inner.thinking_heuristic = !prosody.is_question && !prosody.pitch_rise;
    }

    /// Feed one activity observation with the current silence run length
    pub fn process(&self, activity: VoiceActivity, silence_ms: u64) -> TurnUpdate {
        let mut inner = self.inner.lock();

        match (inner.phase, activity) {
            // First speech frame opens the user's turn
            (TurnPhase::Listening, VoiceActivity::Speech) => {
                inner.phase = TurnPhase::UserTurn;
                inner.dispatched = false;
            }

            // Speech during a pause returns to the active turn
            (TurnPhase::ThinkingPause, VoiceActivity::Speech) => {
                inner.phase = TurnPhase::UserTurn;
            }

            (TurnPhase::UserTurn, VoiceActivity::Silence)
            | (TurnPhase::ThinkingPause, VoiceActivity::Silence) => {
                let threshold = if inner.is_question {
                    self.config.end_of_turn_pause_question_ms
                } else {
                    self.config.end_of_turn_pause_ms
                };

                if silence_ms >= threshold {
                    if !inner.dispatched {
                        inner.dispatched = true;
                        return TurnUpdate {
                            phase: inner.phase,
                            end_of_turn: true,
                        };
                    }
                } else if inner.phase == TurnPhase::UserTurn
                    && inner.thinking_heuristic
                    && silence_ms >= self.config.thinking_pause_min_ms
                    && silence_ms < self.config.thinking_pause_max_ms
                {
                    inner.phase = TurnPhase::ThinkingPause;
                }
            }

            // All other combinations leave the phase unchanged
            _ => {}
        }

        TurnUpdate {
            phase: inner.phase,
            end_of_turn: false,
        }
    }

    /// The corrector asked for clarification; the user text is not committed
    pub fn begin_clarifying(&self) -> Result<(), PipelineError> {
        self.transition(
            &[TurnPhase::UserTurn, TurnPhase::ThinkingPause],
            TurnPhase::Clarifying,
        )
    }

    /// Clarification prompt finished; listen for the reply
    pub fn clarification_done(&self) -> Result<(), PipelineError> {
        self.transition(&[TurnPhase::Clarifying], TurnPhase::Listening)
    }

    /// Nothing usable was transcribed; give the floor back to the user
    pub fn abandon_turn(&self) -> Result<(), PipelineError> {
        self.transition(
            &[TurnPhase::UserTurn, TurnPhase::ThinkingPause],
            TurnPhase::Listening,
        )
    }

    /// The committed turn goes to the dialogue engine
    pub fn begin_assistant(&self) -> Result<(), PipelineError> {
        self.transition(
            &[TurnPhase::UserTurn, TurnPhase::ThinkingPause],
            TurnPhase::AssistantTurn,
        )
    }

    /// Assistant finished speaking
    pub fn assistant_finished(&self) -> Result<(), PipelineError> {
        self.transition(&[TurnPhase::AssistantTurn], TurnPhase::Listening)
    }

    /// Barge-in during the assistant's turn
    pub fn interrupted(&self) -> Result<(), PipelineError> {
        self.transition(&[TurnPhase::AssistantTurn], TurnPhase::Interrupted)
    }

    /// Cancellation complete after an interruption
    pub fn resume_listening(&self) -> Result<(), PipelineError> {
        self.transition(&[TurnPhase::Interrupted], TurnPhase::Listening)
    }

    /// Bridge closed: legal from every phase
    pub fn bridge_closed(&self) {
        let mut inner = self.inner.lock();
        inner.phase = TurnPhase::Ended;
    }

    fn transition(&self, from: &[TurnPhase], to: TurnPhase) -> Result<(), PipelineError> {
        let mut inner = self.inner.lock();
        if !from.contains(&inner.phase) {
            return Err(PipelineError::InvalidTransition(format!(
                "{:?} -> {:?}",
                inner.phase, to
            )));
        }
        tracing::debug!(from = ?inner.phase, to = ?to, "Turn transition");
        inner.phase = to;
        inner.dispatched = false;
        if to == TurnPhase::Listening {
            inner.is_question = false;
            inner.thinking_heuristic = false;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> TurnController {
        TurnController::new(TurnConfig::default())
    }

    fn question_prosody() -> ProsodyFeatures {
        ProsodyFeatures {
            is_question: true,
            has_speech: true,
            ..Default::default()
        }
    }

    fn thinking_prosody() -> ProsodyFeatures {
        ProsodyFeatures {
            is_question: false,
            pitch_rise: false,
            has_speech: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_speech_opens_user_turn() {
        let c = controller();
        let update = c.process(VoiceActivity::Speech, 0);
        assert_eq!(update.phase, TurnPhase::UserTurn);
    }

    #[test]
    fn test_end_of_turn_boundary_exact() {
        let c = controller();
        c.process(VoiceActivity::Speech, 0);

        // 1 ms below the threshold: no dispatch
        let update = c.process(VoiceActivity::Silence, 1499);
        assert!(!update.end_of_turn);

        // Exactly at the threshold: dispatch
        let update = c.process(VoiceActivity::Silence, 1500);
        assert!(update.end_of_turn);
    }

    #[test]
    fn test_end_of_turn_fires_once() {
        let c = controller();
        c.process(VoiceActivity::Speech, 0);
        assert!(c.process(VoiceActivity::Silence, 1500).end_of_turn);
        assert!(!c.process(VoiceActivity::Silence, 1600).end_of_turn);
    }

    #[test]
    fn test_question_shortens_threshold() {
        let c = controller();
        c.process(VoiceActivity::Speech, 0);
        c.update_prosody(&question_prosody());

        assert!(!c.process(VoiceActivity::Silence, 599).end_of_turn);
        assert!(c.process(VoiceActivity::Silence, 600).end_of_turn);
    }

    #[test]
    fn test_thinking_pause_entered() {
        let c = controller();
        c.process(VoiceActivity::Speech, 0);
        c.update_prosody(&thinking_prosody());

        let update = c.process(VoiceActivity::Silence, 900);
        assert_eq!(update.phase, TurnPhase::ThinkingPause);
        assert!(!update.end_of_turn);

        // Resumed speech returns to the user turn
        let update = c.process(VoiceActivity::Speech, 0);
        assert_eq!(update.phase, TurnPhase::UserTurn);
    }

    #[test]
    fn test_thinking_pause_still_dispatches_at_threshold() {
        let c = controller();
        c.process(VoiceActivity::Speech, 0);
        c.update_prosody(&thinking_prosody());
        c.process(VoiceActivity::Silence, 900);

        assert!(c.process(VoiceActivity::Silence, 1500).end_of_turn);
    }

    #[test]
    fn test_clarification_flow() {
        let c = controller();
        c.process(VoiceActivity::Speech, 0);
        c.process(VoiceActivity::Silence, 1500);

        c.begin_clarifying().unwrap();
        assert_eq!(c.phase(), TurnPhase::Clarifying);

        c.clarification_done().unwrap();
        assert_eq!(c.phase(), TurnPhase::Listening);
    }

    #[test]
    fn test_assistant_and_interruption_flow() {
        let c = controller();
        c.process(VoiceActivity::Speech, 0);
        c.process(VoiceActivity::Silence, 1500);

        c.begin_assistant().unwrap();
        assert_eq!(c.phase(), TurnPhase::AssistantTurn);

        c.interrupted().unwrap();
        assert_eq!(c.phase(), TurnPhase::Interrupted);

        c.resume_listening().unwrap();
        assert_eq!(c.phase(), TurnPhase::Listening);
    }

    #[test]
    fn test_impossible_transition_is_error() {
        let c = controller();
        // Interrupted is only reachable from AssistantTurn
        let err = c.interrupted().unwrap_err();
        assert!(matches!(err, PipelineError::InvalidTransition(_)));
    }

    #[test]
    fn test_bridge_closed_from_any_phase() {
        let c = controller();
        c.process(VoiceActivity::Speech, 0);
        c.bridge_closed();
        assert_eq!(c.phase(), TurnPhase::Ended);
    }

    #[test]
    fn test_question_never_enters_thinking_pause() {
        let c = controller();
        c.process(VoiceActivity::Speech, 0);
        c.update_prosody(&question_prosody());

        // At 900ms a question has long since dispatched (600ms threshold)
        let update = c.process(VoiceActivity::Silence, 900);
        assert!(update.end_of_turn || update.phase != TurnPhase::ThinkingPause);
    }
}
