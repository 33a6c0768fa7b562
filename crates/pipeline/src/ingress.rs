//! Audio ingress and segmentation
//!
//! Frames from the bridge are normalized to 16 kHz and accumulated into
//! segments. A segment closes on forward silence of `min_silence_ms`
//! bounded by `max_segment_ms`, or on an explicit flush. A ring buffer the
//! size of the prosody window is kept alongside for the analyzer. While the
//! assistant is speaking, frames above the energy threshold raise an
//! interruption instead of opening a segment.

use std::time::Duration;

use callweave_core::{AudioBuffer, AudioFrame, SampleRate, FRAME_MS};

/// Ingress configuration (see `PipelineSettings` for defaults)
#[derive(Debug, Clone)]
pub struct IngressConfig {
    pub prosody_window_ms: u64,
    pub min_silence_ms: u64,
    pub max_segment_ms: u64,
    pub min_speech_ms: u64,
    pub vad_threshold_db: f32,
    pub barge_in_min_speech_ms: u64,
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            prosody_window_ms: 1500,
            min_silence_ms: 500,
            max_segment_ms: 8000,
            min_speech_ms: 250,
            vad_threshold_db: -40.0,
            barge_in_min_speech_ms: 150,
        }
    }
}

/// A bounded audio slice ready for preprocessing and STT
#[derive(Debug, Clone)]
pub struct Segment {
    /// 16 kHz mono samples
    pub samples: Vec<f32>,
    pub duration_ms: u64,
    /// Milliseconds of detected speech inside the segment
    pub speech_ms: u64,
    /// First frame sequence contributing to the segment
    pub first_sequence: u64,
}

impl Segment {
    /// Segments below `min_speech_ms` are not worth an STT round trip
    pub fn has_enough_speech(&self, min_speech_ms: u64) -> bool {
        self.speech_ms >= min_speech_ms
    }
}

/// Events produced while consuming a frame
#[derive(Debug, Clone)]
pub enum IngressEvent {
    /// First speech frame after silence
    SpeechStarted,
    /// A segment closed and is ready downstream
    SegmentReady(Segment),
    /// Speech above threshold while the assistant was speaking
    Interruption { energy_db: f32 },
}

/// Per-session ingress state
pub struct AudioIngress {
    config: IngressConfig,
    /// Rolling window feeding prosody analysis
    ring: AudioBuffer,
    /// Current segment accumulation
    segment: Vec<f32>,
    segment_first_seq: u64,
    /// Consecutive silence run inside the current segment, ms
    silence_run_ms: u64,
    /// Detected speech inside the current segment, ms
    speech_ms: u64,
    /// Sustained inbound speech while the assistant speaks, ms
    barge_in_speech_ms: u64,
    in_speech: bool,
    draining: bool,
}

impl AudioIngress {
    pub fn new(config: IngressConfig) -> Self {
        let ring = AudioBuffer::new(
            SampleRate::Hz16000,
            Duration::from_millis(config.prosody_window_ms),
        );
        Self {
            config,
            ring,
            segment: Vec::new(),
            segment_first_seq: 0,
            silence_run_ms: 0,
            speech_ms: 0,
            barge_in_speech_ms: 0,
            in_speech: false,
            draining: false,
        }
    }

    /// Consume one bridge frame.
    ///
    /// `assistant_speaking` comes from the playback controller (via the
    /// session runner, not a back-pointer).
    pub fn push_frame(&mut self, frame: &AudioFrame, assistant_speaking: bool) -> Vec<IngressEvent> {
        if self.draining {
            return Vec::new();
        }

        let frame = if frame.sample_rate != SampleRate::Hz16000 {
            frame.resample(SampleRate::Hz16000)
        } else {
            frame.clone()
        };

        self.ring.push(&frame);

        let mut events = Vec::new();
        let is_speech = frame.energy_db >= self.config.vad_threshold_db;
        let frame_ms = frame.duration_ms().max(FRAME_MS as u64);

        // Barge-in detection runs regardless of segmentation state
        if assistant_speaking {
            if is_speech {
                self.barge_in_speech_ms += frame_ms;
                if self.barge_in_speech_ms >= self.config.barge_in_min_speech_ms {
                    events.push(IngressEvent::Interruption {
                        energy_db: frame.energy_db,
                    });
                    self.barge_in_speech_ms = 0;
                }
            } else {
                self.barge_in_speech_ms = 0;
            }
        } else {
            self.barge_in_speech_ms = 0;
        }

        if is_speech && !self.in_speech {
            self.in_speech = true;
            events.push(IngressEvent::SpeechStarted);
        } else if !is_speech {
            self.in_speech = false;
        }

        // Accumulate once any speech has been seen; leading silence is noise
        if !self.segment.is_empty() || is_speech {
            if self.segment.is_empty() {
                self.segment_first_seq = frame.sequence;
            }
            self.segment.extend(frame.samples.iter());

            if is_speech {
                self.speech_ms += frame_ms;
                self.silence_run_ms = 0;
            } else {
                self.silence_run_ms += frame_ms;
            }

            let duration_ms = self.segment_duration_ms();
            let silence_closes =
                self.speech_ms > 0 && self.silence_run_ms >= self.config.min_silence_ms;
            let length_closes = duration_ms >= self.config.max_segment_ms;

            if silence_closes || length_closes {
                if let Some(segment) = self.take_segment() {
                    events.push(IngressEvent::SegmentReady(segment));
                }
            }
        }

        events
    }

    /// Explicit flush from the turn controller
    pub fn flush(&mut self) -> Option<Segment> {
        self.take_segment()
    }

    /// The bridge closed; enter draining and hand back any partial segment
    pub fn close(&mut self) -> Option<Segment> {
        self.draining = true;
        self.take_segment()
    }

    pub fn is_draining(&self) -> bool {
        self.draining
    }

    /// Current prosody window contents
    pub fn prosody_window(&self) -> &[f32] {
        self.ring.samples()
    }

    /// Current silence run, for the turn controller's pause timers
    pub fn silence_run_ms(&self) -> u64 {
        self.silence_run_ms
    }

    fn segment_duration_ms(&self) -> u64 {
        (self.segment.len() as u64 * 1000) / SampleRate::Hz16000.as_u32() as u64
    }

    fn take_segment(&mut self) -> Option<Segment> {
        if self.segment.is_empty() {
            return None;
        }
        let duration_ms = self.segment_duration_ms();
        let segment = Segment {
            samples: std::mem::take(&mut self.segment),
            duration_ms,
            speech_ms: self.speech_ms,
            first_sequence: self.segment_first_seq,
        };
        self.speech_ms = 0;
        self.silence_run_ms = 0;
        tracing::debug!(
            duration_ms = segment.duration_ms,
            speech_ms = segment.speech_ms,
            "Segment closed"
        );
        Some(segment)
    }
}
