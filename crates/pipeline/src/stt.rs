//! STT adapter
//!
//! One in-flight transcription per session. A segment arriving while one is
//! pending queues up to the configured depth; the surplus is dropped and
//! surfaced as a Dropped event. Requests share a process-wide semaphore and
//! run under a wall-clock timeout proportional to segment duration.

use async_trait::async_trait;
use reqwest::multipart;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::io::Cursor;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};

use callweave_core::{Error, Result, SampleRate, SpeechToText, TranscriptionResult, WordConfidence};

use crate::PipelineError;

/// Adapter configuration
#[derive(Debug, Clone)]
pub struct SttConfig {
    /// Timeout for an 8 s segment; shorter segments scale down, ms
    pub timeout_per_8s_ms: u64,
    /// Bounded wait for a semaphore permit, ms
    pub cap_wait_ms: u64,
    /// Queue depth beyond the in-flight request
    pub queue_depth: usize,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            timeout_per_8s_ms: 3000,
            cap_wait_ms: 500,
            queue_depth: 2,
        }
    }
}

/// Process-wide STT adapter
pub struct SttAdapter {
    service: Arc<dyn SpeechToText>,
    semaphore: Arc<Semaphore>,
    config: SttConfig,
}

impl SttAdapter {
    pub fn new(service: Arc<dyn SpeechToText>, in_flight_cap: usize, config: SttConfig) -> Self {
        Self {
            service,
            semaphore: Arc::new(Semaphore::new(in_flight_cap)),
            config,
        }
    }

    fn timeout_for(&self, duration_ms: u64) -> Duration {
        // Proportional: 3 s per 8 s of audio, floor of 1 s for short segments
        let ms = (duration_ms * self.config.timeout_per_8s_ms / 8000).max(1000);
        Duration::from_millis(ms)
    }

    /// Transcribe one segment's samples, respecting the global cap
    pub async fn transcribe(
        &self,
        samples: &[f32],
        duration_ms: u64,
        params: &Value,
    ) -> Result<TranscriptionResult> {
        let permit = tokio::time::timeout(
            Duration::from_millis(self.config.cap_wait_ms),
            self.semaphore.clone().acquire_owned(),
        )
        .await
        .map_err(|_| PipelineError::Overloaded("stt in-flight cap"))
        .map_err(callweave_core::Error::from)?
        .map_err(|_| Error::invariant("stt semaphore closed"))?;

        let start = Instant::now();
        let timeout = self.timeout_for(duration_ms);

        let result = tokio::time::timeout(timeout, self.service.transcribe(samples, params))
            .await
            .map_err(|_| Error::dependency("stt", format!("timed out after {:?}", timeout)))?;

        drop(permit);

        let elapsed = start.elapsed().as_millis() as u64;
        metrics::histogram!("stt_latency_ms").record(elapsed as f64);

        result
    }

    pub fn queue_depth(&self) -> usize {
        self.config.queue_depth
    }
}

/// Outcome of submitting a segment to the per-session queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SttSubmit {
    Accepted,
    /// Queue full; the segment was dropped
    Dropped,
}

/// A transcription job flowing through the queue
pub struct SttJob {
    pub samples: Vec<f32>,
    pub duration_ms: u64,
}

/// Per-session serial queue over the shared adapter.
///
/// Capacity = in-flight (1) + `queue_depth`. Results come back in
/// submission order on the result channel.
pub struct SttQueue {
    tx: mpsc::Sender<SttJob>,
}

impl SttQueue {
    pub fn spawn(
        adapter: Arc<SttAdapter>,
        params: Value,
        result_tx: mpsc::Sender<Result<TranscriptionResult>>,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<SttJob>(adapter.queue_depth().max(1));

        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let result = adapter
                    .transcribe(&job.samples, job.duration_ms, &params)
                    .await;
                if result_tx.send(result).await.is_err() {
                    // Session is gone; stop consuming
                    break;
                }
            }
            tracing::debug!("STT queue worker exiting");
        });

        Self { tx }
    }

    /// Submit without waiting; a full queue drops the segment
    pub fn submit(&self, job: SttJob) -> SttSubmit {
        match self.tx.try_send(job) {
            Ok(()) => SttSubmit::Accepted,
            Err(mpsc::error::TrySendError::Full(_)) => {
                metrics::counter!("stt_segments_dropped_total").increment(1);
                tracing::warn!("STT queue full, dropping segment");
                SttSubmit::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(_)) => SttSubmit::Dropped,
        }
    }
}

/// Wire format of the transcription response
#[derive(Debug, Deserialize)]
struct WireTranscription {
    #[serde(default)]
    text: String,
    #[serde(default)]
    corrected_text: Option<String>,
    #[serde(default)]
    language: String,
    #[serde(default)]
    confidence: f32,
    #[serde(default)]
    segments: Vec<WireSegment>,
    #[serde(default)]
    word_confidences: Vec<WireWord>,
}

#[derive(Debug, Deserialize)]
struct WireSegment {
    #[serde(default)]
    start: f32,
    #[serde(default)]
    end: f32,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct WireWord {
    word: String,
    confidence: f32,
    #[serde(default)]
    start: f32,
    #[serde(default)]
    end: f32,
}

/// HTTP transcription service
pub struct HttpSttService {
    client: Client,
    base_url: String,
}

impl HttpSttService {
    pub fn new(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.to_string(),
        }
    }

    /// Encode 16 kHz mono samples as an in-memory WAV
    fn to_wav(samples: &[f32]) -> Result<Vec<u8>> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: SampleRate::Hz16000.as_u32(),
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };

        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec)
                .map_err(|e| Error::dependency("stt", format!("wav init: {}", e)))?;
            for &sample in samples {
                let pcm = (sample.clamp(-1.0, 1.0) * 32767.0) as i16;
                writer
                    .write_sample(pcm)
                    .map_err(|e| Error::dependency("stt", format!("wav write: {}", e)))?;
            }
            writer
                .finalize()
                .map_err(|e| Error::dependency("stt", format!("wav finalize: {}", e)))?;
        }
        Ok(cursor.into_inner())
    }
}

#[async_trait]
impl SpeechToText for HttpSttService {
    async fn transcribe(&self, samples: &[f32], params: &Value) -> Result<TranscriptionResult> {
        let wav = Self::to_wav(samples)?;

        let mut form = multipart::Form::new().part(
            "audio",
            multipart::Part::bytes(wav)
                .file_name("segment.wav")
                .mime_str("audio/wav")
                .map_err(|e| Error::dependency("stt", e))?,
        );

        if let Some(conversation_id) = params.get("conversation_id").and_then(|v| v.as_str()) {
            form = form.text("conversation_id", conversation_id.to_string());
        }
        form = form
            .text(
                "enable_correction",
                params
                    .get("enable_correction")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false)
                    .to_string(),
            )
            .text(
                "enable_clarification",
                params
                    .get("enable_clarification")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false)
                    .to_string(),
            );

        let response = self
            .client
            .post(format!("{}/transcribe/enhanced", self.base_url))
            .multipart(form)
            .send()
            .await
            .map_err(|e| Error::dependency("stt", e))?;

        if !response.status().is_success() {
            return Err(Error::dependency(
                "stt",
                format!("status {}", response.status()),
            ));
        }

        let wire: WireTranscription = response
            .json()
            .await
            .map_err(|e| Error::dependency("stt", e))?;

        Ok(TranscriptionResult {
            text: wire.text,
            corrected_text: wire.corrected_text,
            language: wire.language,
            confidence: wire.confidence,
            segments: wire
                .segments
                .into_iter()
                .map(|s| (s.start, s.end, s.text))
                .collect(),
            words: wire
                .word_confidences
                .into_iter()
                .map(|w| WordConfidence {
                    word: w.word,
                    confidence: w.confidence,
                    start: w.start,
                    end: w.end,
                })
                .collect(),
        })
    }

    async fn learn_correction(&self, original: &str, corrected: &str) -> Result<()> {
        let form = multipart::Form::new()
            .text("original_text", original.to_string())
            .text("corrected_text", corrected.to_string());

        let response = self
            .client
            .post(format!("{}/learn_correction", self.base_url))
            .multipart(form)
            .send()
            .await
            .map_err(|e| Error::dependency("stt", e))?;

        if !response.status().is_success() {
            return Err(Error::dependency(
                "stt",
                format!("status {}", response.status()),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeStt {
        delay: Duration,
    }

    #[async_trait]
    impl SpeechToText for FakeStt {
        async fn transcribe(&self, _samples: &[f32], _params: &Value) -> Result<TranscriptionResult> {
            tokio::time::sleep(self.delay).await;
            Ok(TranscriptionResult {
                text: "hola".to_string(),
                confidence: 0.9,
                ..Default::default()
            })
        }

        async fn learn_correction(&self, _original: &str, _corrected: &str) -> Result<()> {
            Ok(())
        }
    }

    fn adapter(delay: Duration, cap: usize) -> Arc<SttAdapter> {
        Arc::new(SttAdapter::new(
            Arc::new(FakeStt { delay }),
            cap,
            SttConfig::default(),
        ))
    }

    #[tokio::test]
    async fn test_transcribe_happy_path() {
        let adapter = adapter(Duration::from_millis(1), 4);
        let result = adapter
            .transcribe(&[0.0; 1600], 100, &Value::Null)
            .await
            .unwrap();
        assert_eq!(result.text, "hola");
    }

    #[tokio::test]
    async fn test_proportional_timeout() {
        let adapter = adapter(Duration::from_millis(1), 4);
        // 8s segment -> 3s; 4s segment -> 1.5s; floor at 1s
        assert_eq!(adapter.timeout_for(8000), Duration::from_millis(3000));
        assert_eq!(adapter.timeout_for(4000), Duration::from_millis(1500));
        assert_eq!(adapter.timeout_for(500), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_cap_overload() {
        let adapter = Arc::new(SttAdapter::new(
            Arc::new(FakeStt {
                delay: Duration::from_secs(10),
            }),
            1,
            SttConfig {
                cap_wait_ms: 20,
                ..Default::default()
            },
        ));

        // Occupy the single slot
        let a = adapter.clone();
        let hold = tokio::spawn(async move { a.transcribe(&[0.0; 160], 100, &Value::Null).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = adapter
            .transcribe(&[0.0; 160], 100, &Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), callweave_core::ErrorKind::Overloaded);
        hold.abort();
    }

    #[tokio::test]
    async fn test_queue_drops_beyond_depth() {
        let slow = adapter(Duration::from_secs(5), 1);
        let (result_tx, _result_rx) = mpsc::channel(8);
        let queue = SttQueue::spawn(slow, Value::Null, result_tx);

        let job = || SttJob {
            samples: vec![0.0; 160],
            duration_ms: 100,
        };

        // First fills the worker, next two fill the queue (depth 2)
        assert_eq!(queue.submit(job()), SttSubmit::Accepted);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.submit(job()), SttSubmit::Accepted);
        assert_eq!(queue.submit(job()), SttSubmit::Accepted);
        // Overflow drops
        assert_eq!(queue.submit(job()), SttSubmit::Dropped);
    }

    #[tokio::test]
    async fn test_queue_results_in_order() {
        let fast = adapter(Duration::from_millis(1), 4);
        let (result_tx, mut result_rx) = mpsc::channel(8);
        let queue = SttQueue::spawn(fast, Value::Null, result_tx);

        queue.submit(SttJob {
            samples: vec![0.0; 160],
            duration_ms: 100,
        });
        queue.submit(SttJob {
            samples: vec![0.0; 160],
            duration_ms: 100,
        });

        assert!(result_rx.recv().await.unwrap().is_ok());
        assert!(result_rx.recv().await.unwrap().is_ok());
    }

    #[test]
    fn test_wav_encoding() {
        let wav = HttpSttService::to_wav(&[0.0, 0.5, -0.5]).unwrap();
        // RIFF header + fmt + data
        assert_eq!(&wav[..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
    }
}
