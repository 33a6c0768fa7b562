//! Interrupt handler
//!
//! Gates the synthesis side of the chain after a barge-in: sentences not
//! yet handed to TTS and audio not yet played are dropped until the chain
//! is reset. A short grace period after the assistant starts avoids
//! cancelling on echo of its own opening.

use async_trait::async_trait;
use parking_lot::Mutex;

use callweave_core::{ControlFrame, Frame, FrameProcessor, ProcessorContext, Result};

/// Handler configuration
#[derive(Debug, Clone)]
pub struct InterruptHandlerConfig {
    /// Frames ignored right after speaking starts (20 ms each)
    pub grace_period_ms: u64,
}

impl Default for InterruptHandlerConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: 200,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandlerState {
    Idle,
    Speaking,
    Interrupted,
}

struct Inner {
    state: HandlerState,
    /// Milliseconds of assistant audio seen since speaking started
    speaking_ms: u64,
}

/// Barge-in gate on the synthesis chain
pub struct InterruptHandler {
    config: InterruptHandlerConfig,
    inner: Mutex<Inner>,
}

impl InterruptHandler {
    pub fn new(config: InterruptHandlerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: HandlerState::Idle,
                speaking_ms: 0,
            }),
        }
    }

    pub fn default_config() -> Self {
        Self::new(InterruptHandlerConfig::default())
    }

    pub fn is_interrupted(&self) -> bool {
        self.inner.lock().state == HandlerState::Interrupted
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = HandlerState::Idle;
        inner.speaking_ms = 0;
    }
}

#[async_trait]
impl FrameProcessor for InterruptHandler {
    async fn process(&self, frame: Frame, _context: &mut ProcessorContext) -> Result<Vec<Frame>> {
        match &frame {
            Frame::BargeIn { .. } => {
                let mut inner = self.inner.lock();
                match inner.state {
                    HandlerState::Speaking => {
                        if inner.speaking_ms < self.config.grace_period_ms {
                            // Still in the grace window; swallow the signal
                            return Ok(vec![]);
                        }
                        inner.state = HandlerState::Interrupted;
                        tracing::debug!("Barge-in accepted, gating synthesis output");
                        Ok(vec![frame])
                    }
                    // Not speaking: nothing to interrupt
                    _ => Ok(vec![]),
                }
            }

            Frame::AudioOutput { frame: audio, .. } => {
                let mut inner = self.inner.lock();
                match inner.state {
                    HandlerState::Interrupted => Ok(vec![]),
                    _ => {
                        if inner.state == HandlerState::Idle {
                            inner.state = HandlerState::Speaking;
                            inner.speaking_ms = 0;
                        }
                        inner.speaking_ms += audio.duration_ms();
                        Ok(vec![frame])
                    }
                }
            }

            Frame::Sentence { .. } => {
                if self.is_interrupted() {
                    // Cancelled synthesis: drop sentences not yet started
                    Ok(vec![])
                } else {
                    Ok(vec![frame])
                }
            }

            Frame::Control(ControlFrame::Reset) => {
                self.reset();
                Ok(vec![frame])
            }

            Frame::EndOfStream => {
                self.reset();
                Ok(vec![frame])
            }

            _ => Ok(vec![frame]),
        }
    }

    fn name(&self) -> &'static str {
        "interrupt_handler"
    }

    async fn on_stop(&self, _context: &mut ProcessorContext) -> Result<()> {
        self.reset();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use callweave_core::{AudioFrame, SampleRate};

    fn audio_frame() -> Frame {
        Frame::AudioOutput {
            frame: AudioFrame::new(vec![0.1; 320], SampleRate::Hz16000, 0),
            chunk_seq: 0,
            generation: 1,
        }
    }

    fn sentence(index: usize) -> Frame {
        Frame::Sentence {
            text: "una frase de prueba".to_string(),
            index,
        }
    }

    async fn speak_past_grace(handler: &InterruptHandler, ctx: &mut ProcessorContext) {
        // 12 frames of 20 ms = 240 ms, past the 200 ms grace window
        for _ in 0..12 {
            handler.process(audio_frame(), ctx).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_barge_in_gates_output() {
        let handler = InterruptHandler::default_config();
        let mut ctx = ProcessorContext::default();

        speak_past_grace(&handler, &mut ctx).await;

        let frames = handler
            .process(Frame::BargeIn { played_until_ms: 240 }, &mut ctx)
            .await
            .unwrap();
        assert_eq!(frames.len(), 1);
        assert!(handler.is_interrupted());

        // Audio and sentences are now blocked
        assert!(handler.process(audio_frame(), &mut ctx).await.unwrap().is_empty());
        assert!(handler.process(sentence(3), &mut ctx).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_grace_period_swallows_barge_in() {
        let handler = InterruptHandler::default_config();
        let mut ctx = ProcessorContext::default();

        // Only 60 ms spoken
        for _ in 0..3 {
            handler.process(audio_frame(), &mut ctx).await.unwrap();
        }

        let frames = handler
            .process(Frame::BargeIn { played_until_ms: 60 }, &mut ctx)
            .await
            .unwrap();
        assert!(frames.is_empty());
        assert!(!handler.is_interrupted());
    }

    #[tokio::test]
    async fn test_barge_in_while_idle_is_dropped() {
        let handler = InterruptHandler::default_config();
        let mut ctx = ProcessorContext::default();

        let frames = handler
            .process(Frame::BargeIn { played_until_ms: 0 }, &mut ctx)
            .await
            .unwrap();
        assert!(frames.is_empty());
    }

    #[tokio::test]
    async fn test_reset_reopens_gate() {
        let handler = InterruptHandler::default_config();
        let mut ctx = ProcessorContext::default();

        speak_past_grace(&handler, &mut ctx).await;
        handler
            .process(Frame::BargeIn { played_until_ms: 240 }, &mut ctx)
            .await
            .unwrap();
        assert!(handler.is_interrupted());

        handler
            .process(Frame::Control(ControlFrame::Reset), &mut ctx)
            .await
            .unwrap();
        assert!(!handler.is_interrupted());
        assert_eq!(handler.process(sentence(0), &mut ctx).await.unwrap().len(), 1);
    }
}
