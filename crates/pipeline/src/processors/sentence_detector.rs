//! Sentence detector for streaming dialogue output
//!
//! Buffers token deltas and emits complete sentences for synthesis. The
//! boundary set is `{. ! ? ; newline}`; chunks shorter than the minimum
//! word count keep buffering so pathologically short syntheses are avoided.

use async_trait::async_trait;
use parking_lot::Mutex;

use callweave_core::{ControlFrame, Frame, FrameProcessor, ProcessorContext, Result};

/// Sentence boundary characters
const TERMINATORS: &[char] = &['.', '!', '?', ';', '\n'];

/// Detector configuration
#[derive(Debug, Clone)]
pub struct SentenceDetectorConfig {
    /// Minimum words per emitted chunk
    pub min_words: usize,
    /// Buffer size that forces emission at a word boundary
    pub max_buffer_chars: usize,
}

impl Default for SentenceDetectorConfig {
    fn default() -> Self {
        Self {
            min_words: 3,
            max_buffer_chars: 500,
        }
    }
}

/// Buffers dialogue deltas and emits sentence frames
pub struct SentenceDetector {
    config: SentenceDetectorConfig,
    buffer: Mutex<String>,
    sentence_index: Mutex<usize>,
}

impl SentenceDetector {
    pub fn new(config: SentenceDetectorConfig) -> Self {
        Self {
            config,
            buffer: Mutex::new(String::new()),
            sentence_index: Mutex::new(0),
        }
    }

    pub fn default_config() -> Self {
        Self::new(SentenceDetectorConfig::default())
    }

    /// Split buffered text into complete sentences and the remaining tail.
    ///
    /// A candidate shorter than `min_words` is merged forward rather than
    /// emitted on its own.
    fn split_sentences(&self, text: &str) -> (Vec<String>, String) {
        let mut sentences = Vec::new();
        let mut current = String::new();

        for c in text.chars() {
            current.push(c);
            if TERMINATORS.contains(&c) {
                let candidate = current.trim();
                if candidate.is_empty() {
                    current.clear();
                    continue;
                }
                if word_count(candidate) >= self.config.min_words {
                    sentences.push(candidate.to_string());
                    current.clear();
                }
                // Below the minimum: keep accumulating into the next sentence
            }
        }

        (sentences, current)
    }

    fn extract(&self) -> Vec<String> {
        let mut buffer = self.buffer.lock();
        let (sentences, remaining) = self.split_sentences(&buffer);
        *buffer = remaining;
        sentences
    }

    fn flush_buffer(&self) -> Option<String> {
        let mut buffer = self.buffer.lock();
        let text = buffer.trim().to_string();
        buffer.clear();
        if text.is_empty() {
            None
        } else {
            Some(text)
        }
    }

    fn sentence_frames(&self, sentences: Vec<String>) -> Vec<Frame> {
        let mut index = self.sentence_index.lock();
        sentences
            .into_iter()
            .map(|text| {
                let frame = Frame::Sentence { text, index: *index };
                *index += 1;
                frame
            })
            .collect()
    }

    pub fn reset(&self) {
        self.buffer.lock().clear();
        *self.sentence_index.lock() = 0;
    }
}

fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

#[async_trait]
impl FrameProcessor for SentenceDetector {
    async fn process(&self, frame: Frame, _context: &mut ProcessorContext) -> Result<Vec<Frame>> {
        match frame {
            Frame::LlmChunk { text, is_final } => {
                self.buffer.lock().push_str(&text);

                let mut sentences = self.extract();

                if is_final {
                    if let Some(remaining) = self.flush_buffer() {
                        sentences.push(remaining);
                    }
                } else if sentences.is_empty() {
                    // Force emission at a word boundary when the buffer runs long
                    let mut buffer = self.buffer.lock();
                    if buffer.len() >= self.config.max_buffer_chars {
                        if let Some(pos) = buffer.rfind(char::is_whitespace) {
                            let partial = buffer[..pos].trim().to_string();
                            *buffer = buffer[pos..].to_string();
                            if !partial.is_empty() {
                                sentences.push(partial);
                            }
                        }
                    }
                }

                Ok(self.sentence_frames(sentences))
            }

            Frame::Control(ControlFrame::Flush) => {
                let mut frames = Vec::new();
                if let Some(remaining) = self.flush_buffer() {
                    frames.extend(self.sentence_frames(vec![remaining]));
                }
                frames.push(frame);
                Ok(frames)
            }

            Frame::Control(ControlFrame::Reset) => {
                self.reset();
                Ok(vec![frame])
            }

            Frame::EndOfStream => {
                let mut frames = Vec::new();
                if let Some(remaining) = self.flush_buffer() {
                    frames.extend(self.sentence_frames(vec![remaining]));
                }
                frames.push(frame);
                Ok(frames)
            }

            other => Ok(vec![other]),
        }
    }

    fn name(&self) -> &'static str {
        "sentence_detector"
    }

    async fn on_stop(&self, _context: &mut ProcessorContext) -> Result<()> {
        self.reset();
        Ok(())
    }
}
