//! Audio frame types and utilities
//!
//! The bridge delivers 16-bit PCM mono at 8 or 16 kHz in 20 ms frames;
//! everything downstream runs at 16 kHz. Samples are held as f32 in
//! [-1.0, 1.0] for processing.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Canonical frame duration delivered by the telephony bridge
pub const FRAME_MS: u32 = 20;

const PCM16_NORMALIZE: f32 = 32768.0;
const PCM16_SCALE: f32 = 32767.0;

/// Sample rates the bridge may declare
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SampleRate {
    /// 8kHz - narrowband telephony
    Hz8000,
    /// 16kHz - canonical internal rate
    #[default]
    Hz16000,
}

impl SampleRate {
    pub fn as_u32(&self) -> u32 {
        match self {
            SampleRate::Hz8000 => 8000,
            SampleRate::Hz16000 => 16000,
        }
    }

    pub fn from_u32(rate: u32) -> Option<Self> {
        match rate {
            8000 => Some(SampleRate::Hz8000),
            16000 => Some(SampleRate::Hz16000),
            _ => None,
        }
    }

    /// Samples in one 20 ms frame
    pub fn frame_size_20ms(&self) -> usize {
        (self.as_u32() as usize * FRAME_MS as usize) / 1000
    }

    pub fn samples_per_ms(&self) -> usize {
        self.as_u32() as usize / 1000
    }
}

/// One audio frame with derived metadata
#[derive(Clone)]
pub struct AudioFrame {
    /// Samples normalized to [-1.0, 1.0]
    pub samples: Arc<[f32]>,
    pub sample_rate: SampleRate,
    /// Sequence number assigned by the producer for ordering
    pub sequence: u64,
    pub timestamp: Instant,
    pub duration: Duration,
    /// RMS energy in dB, computed on construction
    pub energy_db: f32,
}

impl std::fmt::Debug for AudioFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioFrame")
            .field("samples_len", &self.samples.len())
            .field("sample_rate", &self.sample_rate)
            .field("sequence", &self.sequence)
            .field("duration", &self.duration)
            .field("energy_db", &self.energy_db)
            .finish()
    }
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, sample_rate: SampleRate, sequence: u64) -> Self {
        let duration =
            Duration::from_secs_f64(samples.len() as f64 / sample_rate.as_u32() as f64);
        let energy_db = Self::calculate_energy_db(&samples);

        Self {
            samples: samples.into(),
            sample_rate,
            sequence,
            timestamp: Instant::now(),
            duration,
            energy_db,
        }
    }

    /// RMS energy in decibels; -96 dB floor for silence
    fn calculate_energy_db(samples: &[f32]) -> f32 {
        if samples.is_empty() {
            return -96.0;
        }

        let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
        let rms = (sum_squares / samples.len() as f32).sqrt();

        if rms > 0.0 {
            20.0 * rms.log10()
        } else {
            -96.0
        }
    }

    /// Decode PCM16 little-endian bytes
    pub fn from_pcm16(bytes: &[u8], sample_rate: SampleRate, sequence: u64) -> Self {
        let samples: Vec<f32> = bytes
            .chunks_exact(2)
            .map(|chunk| {
                let sample = i16::from_le_bytes([chunk[0], chunk[1]]);
                sample as f32 / PCM16_NORMALIZE
            })
            .collect();

        Self::new(samples, sample_rate, sequence)
    }

    /// Encode to PCM16 little-endian bytes
    pub fn to_pcm16(&self) -> Vec<u8> {
        self.samples
            .iter()
            .flat_map(|&sample| {
                let clamped = sample.clamp(-1.0, 1.0);
                let pcm16 = (clamped * PCM16_SCALE) as i16;
                pcm16.to_le_bytes()
            })
            .collect()
    }

    /// Resample to the target rate by linear interpolation.
    ///
    /// The only conversion on the hot path is 8 kHz bridge audio up to the
    /// 16 kHz canonical rate, on 20 ms frames, where linear interpolation is
    /// adequate.
    pub fn resample(&self, target_rate: SampleRate) -> Self {
        if self.sample_rate == target_rate {
            return self.clone();
        }

        let ratio = target_rate.as_u32() as f64 / self.sample_rate.as_u32() as f64;
        let new_len = (self.samples.len() as f64 * ratio) as usize;

        let mut resampled = Vec::with_capacity(new_len);
        for i in 0..new_len {
            let src_idx = i as f64 / ratio;
            let idx_floor = src_idx.floor() as usize;
            let idx_ceil = (idx_floor + 1).min(self.samples.len().saturating_sub(1));
            let frac = (src_idx - idx_floor as f64) as f32;

            let sample = self.samples[idx_floor] * (1.0 - frac) + self.samples[idx_ceil] * frac;
            resampled.push(sample);
        }

        Self::new(resampled, target_rate, self.sequence)
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration.as_millis() as u64
    }

    pub fn is_likely_silence(&self, threshold_db: f32) -> bool {
        self.energy_db < threshold_db
    }
}

/// Accumulating buffer with a bounded duration
///
/// Backs both the ingress ring (bounded to the prosody window) and segment
/// accumulation.
#[derive(Debug)]
pub struct AudioBuffer {
    samples: Vec<f32>,
    sample_rate: SampleRate,
    max_duration: Duration,
}

impl AudioBuffer {
    pub fn new(sample_rate: SampleRate, max_duration: Duration) -> Self {
        let max_samples = (sample_rate.as_u32() as f64 * max_duration.as_secs_f64()) as usize;

        Self {
            samples: Vec::with_capacity(max_samples),
            sample_rate,
            max_duration,
        }
    }

    /// Push a frame, resampling if needed; oldest samples are dropped once
    /// the buffer exceeds its maximum duration.
    pub fn push(&mut self, frame: &AudioFrame) {
        let frame = if frame.sample_rate != self.sample_rate {
            frame.resample(self.sample_rate)
        } else {
            frame.clone()
        };

        self.samples.extend(frame.samples.iter());

        let max_samples =
            (self.sample_rate.as_u32() as f64 * self.max_duration.as_secs_f64()) as usize;

        if self.samples.len() > max_samples {
            let excess = self.samples.len() - max_samples;
            self.samples.drain(0..excess);
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate.as_u32() as f64)
    }

    pub fn sample_rate(&self) -> SampleRate {
        self.sample_rate
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    /// Take everything accumulated so far
    pub fn take(&mut self) -> Vec<f32> {
        std::mem::take(&mut self.samples)
    }

    pub fn has_duration(&self, duration: Duration) -> bool {
        self.duration() >= duration
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_rate_conversions() {
        assert_eq!(SampleRate::Hz16000.as_u32(), 16000);
        assert_eq!(SampleRate::Hz16000.frame_size_20ms(), 320);
        assert_eq!(SampleRate::Hz8000.frame_size_20ms(), 160);
        assert_eq!(SampleRate::from_u32(8000), Some(SampleRate::Hz8000));
        assert_eq!(SampleRate::from_u32(44100), None);
    }

    #[test]
    fn test_audio_frame_from_pcm16() {
        let pcm16: Vec<u8> = vec![0x00, 0x40, 0x00, 0xC0]; // Two samples
        let frame = AudioFrame::from_pcm16(&pcm16, SampleRate::Hz16000, 0);

        assert_eq!(frame.samples.len(), 2);
        assert!(frame.samples[0] > 0.0);
        assert!(frame.samples[1] < 0.0);
    }

    #[test]
    fn test_pcm16_round_trip() {
        let pcm16: Vec<u8> = vec![0x10, 0x20, 0xF0, 0x8F, 0x00, 0x00];
        let frame = AudioFrame::from_pcm16(&pcm16, SampleRate::Hz16000, 0);
        let back = frame.to_pcm16();
        assert_eq!(back.len(), pcm16.len());
    }

    #[test]
    fn test_audio_frame_resample_upsamples_bridge_audio() {
        let samples = vec![0.0f32; 160]; // 20ms at 8kHz
        let frame = AudioFrame::new(samples, SampleRate::Hz8000, 0);

        let resampled = frame.resample(SampleRate::Hz16000);
        assert_eq!(resampled.samples.len(), 320);
    }

    #[test]
    fn test_energy_calculation() {
        let silent = AudioFrame::new(vec![0.0; 320], SampleRate::Hz16000, 0);
        assert!(silent.energy_db < -90.0);

        let loud = AudioFrame::new(vec![0.5; 320], SampleRate::Hz16000, 0);
        assert!(loud.energy_db > -10.0);
    }

    #[test]
    fn test_audio_buffer_bounded() {
        let mut buffer = AudioBuffer::new(SampleRate::Hz16000, Duration::from_millis(100));

        for seq in 0..20 {
            let frame = AudioFrame::new(vec![0.1; 320], SampleRate::Hz16000, seq);
            buffer.push(&frame);
        }

        // 100ms at 16kHz = 1600 samples max
        assert!(buffer.samples().len() <= 1600);
        assert!(buffer.has_duration(Duration::from_millis(99)));
    }

    #[test]
    fn test_audio_buffer_take() {
        let mut buffer = AudioBuffer::new(SampleRate::Hz16000, Duration::from_secs(10));
        let frame = AudioFrame::new(vec![0.1; 320], SampleRate::Hz16000, 0);
        buffer.push(&frame);

        let taken = buffer.take();
        assert_eq!(taken.len(), 320);
        assert!(buffer.is_empty());
    }
}
