//! TTS streamer
//!
//! At most one synthesis in flight per session; starting a new one cancels
//! the previous. Chunks carry a generation and sequence number so playback
//! can discard output from a cancelled synthesis. Synthesis slots are
//! capped process-wide.

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::Client;
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;

use callweave_core::{AudioFrame, Error, Result, SampleRate, TextToSpeech, TtsChunk};

use crate::PipelineError;

/// Streamer configuration
#[derive(Debug, Clone)]
pub struct TtsStreamerConfig {
    /// Bounded wait for a synthesis slot, ms
    pub cap_wait_ms: u64,
    /// Soft target for the first audio byte, ms (logged when missed)
    pub first_byte_target_ms: u64,
}

impl Default for TtsStreamerConfig {
    fn default() -> Self {
        Self {
            cap_wait_ms: 500,
            first_byte_target_ms: 400,
        }
    }
}

/// Per-session TTS streamer over the shared service
pub struct TtsStreamer {
    service: Arc<dyn TextToSpeech>,
    semaphore: Arc<Semaphore>,
    config: TtsStreamerConfig,
    generation: Arc<AtomicU64>,
    current: Mutex<Option<JoinHandle<()>>>,
}

impl TtsStreamer {
    pub fn new(
        service: Arc<dyn TextToSpeech>,
        semaphore: Arc<Semaphore>,
        config: TtsStreamerConfig,
    ) -> Self {
        Self {
            service,
            semaphore,
            config,
            generation: Arc::new(AtomicU64::new(0)),
            current: Mutex::new(None),
        }
    }

    /// Shared semaphore sized to the process-wide in-flight cap
    pub fn shared_cap(cap: usize) -> Arc<Semaphore> {
        Arc::new(Semaphore::new(cap))
    }

    /// Current synthesis generation
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Start synthesizing one sentence chunk.
    ///
    /// Any in-flight synthesis is cancelled first. Chunks are delivered on
    /// `out_tx` tagged with the new generation.
    pub async fn speak(
        &self,
        text: &str,
        voice_profile_id: Option<String>,
        out_tx: mpsc::Sender<(u64, TtsChunk)>,
    ) -> Result<u64> {
        // Invariant: at most one in-flight synthesis per session
        self.cancel();

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;

        let permit = tokio::time::timeout(
            Duration::from_millis(self.config.cap_wait_ms),
            self.semaphore.clone().acquire_owned(),
        )
        .await
        .map_err(|_| PipelineError::Overloaded("tts in-flight cap"))
        .map_err(Error::from)?
        .map_err(|_| Error::invariant("tts semaphore closed"))?;

        let service = self.service.clone();
        let text = text.to_string();
        let generation_counter = self.generation.clone();
        let first_byte_target = Duration::from_millis(self.config.first_byte_target_ms);

        let handle = tokio::spawn(async move {
            let _permit = permit;
            let start = Instant::now();
            let (chunk_tx, mut chunk_rx) = mpsc::channel::<TtsChunk>(64);

            let synth = tokio::spawn({
                let service = service.clone();
                let text = text.clone();
                async move {
                    service
                        .synthesize(&text, voice_profile_id.as_deref(), chunk_tx)
                        .await
                }
            });

            let mut first = true;
            while let Some(chunk) = chunk_rx.recv().await {
                if generation_counter.load(Ordering::Acquire) != generation {
                    // A newer synthesis superseded us
                    break;
                }
                if first {
                    first = false;
                    let elapsed = start.elapsed();
                    metrics::histogram!("tts_first_byte_ms").record(elapsed.as_millis() as f64);
                    if elapsed > first_byte_target {
                        tracing::debug!(
                            elapsed_ms = elapsed.as_millis() as u64,
                            target_ms = first_byte_target.as_millis() as u64,
                            "TTS first byte missed soft target"
                        );
                    }
                }
                if out_tx.send((generation, chunk)).await.is_err() {
                    break;
                }
            }

            match synth.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "TTS synthesis failed");
                }
                Err(e) if e.is_cancelled() => {}
                Err(e) => {
                    tracing::error!(error = %e, "TTS synthesis task panicked");
                }
            }
        });

        *self.current.lock() = Some(handle);
        Ok(generation)
    }

    /// Cancel the in-flight synthesis, if any. The generation advances so
    /// late chunks from the old synthesis are discarded by consumers.
    pub fn cancel(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        if let Some(handle) = self.current.lock().take() {
            handle.abort();
        }
    }

    /// Wait for the current synthesis to finish naturally
    pub async fn join(&self) {
        let handle = self.current.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

/// Trailer closing a synthesis stream
#[derive(Debug, Deserialize)]
struct TtsTrailer {
    #[allow(dead_code)]
    duration_ms: u64,
    #[allow(dead_code)]
    samples: u64,
}

/// HTTP synthesis service streaming PCM16 chunks with a JSON trailer
pub struct HttpTtsService {
    client: Client,
    url: String,
}

impl HttpTtsService {
    pub fn new(client: Client, base_url: &str) -> Self {
        Self {
            client,
            url: format!("{}/synthesize", base_url),
        }
    }
}

#[async_trait]
impl TextToSpeech for HttpTtsService {
    async fn synthesize(
        &self,
        text: &str,
        voice_profile_id: Option<&str>,
        tx: mpsc::Sender<TtsChunk>,
    ) -> Result<()> {
        let body = serde_json::json!({
            "text": text,
            "voice_profile_id": voice_profile_id,
            "format": "pcm16",
        });

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::dependency("tts", e))?;

        if !response.status().is_success() {
            return Err(Error::dependency(
                "tts",
                format!("status {}", response.status()),
            ));
        }

        let mut stream = response.bytes_stream();
        let mut seq = 0u64;
        // One chunk of lookahead so the JSON trailer is not emitted as audio
        let mut held: Option<Vec<u8>> = None;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Error::dependency("tts", e))?;
            if let Some(bytes) = held.replace(chunk.to_vec()) {
                let audio = AudioFrame::from_pcm16(&bytes, SampleRate::Hz16000, seq);
                if tx
                    .send(TtsChunk {
                        audio,
                        seq,
                        is_final: false,
                    })
                    .await
                    .is_err()
                {
                    // Receiver dropped: synthesis cancelled
                    return Ok(());
                }
                seq += 1;
            }
        }

        if let Some(bytes) = held {
            // The last chunk is either the trailer or final audio
            if serde_json::from_slice::<TtsTrailer>(&bytes).is_err() {
                let audio = AudioFrame::from_pcm16(&bytes, SampleRate::Hz16000, seq);
                let _ = tx
                    .send(TtsChunk {
                        audio,
                        seq,
                        is_final: true,
                    })
                    .await;
            } else if seq > 0 {
                // Trailer consumed; re-flag the previous chunk was final is
                // not possible, so emit an empty final marker
                let _ = tx
                    .send(TtsChunk {
                        audio: AudioFrame::new(Vec::new(), SampleRate::Hz16000, seq),
                        seq,
                        is_final: true,
                    })
                    .await;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Synthesizes `chunks` frames of silence, `delay` apart
    struct FakeTts {
        chunks: usize,
        delay: Duration,
    }

    #[async_trait]
    impl TextToSpeech for FakeTts {
        async fn synthesize(
            &self,
            _text: &str,
            _voice: Option<&str>,
            tx: mpsc::Sender<TtsChunk>,
        ) -> Result<()> {
            for seq in 0..self.chunks {
                tokio::time::sleep(self.delay).await;
                let chunk = TtsChunk {
                    audio: AudioFrame::new(vec![0.1; 320], SampleRate::Hz16000, seq as u64),
                    seq: seq as u64,
                    is_final: seq + 1 == self.chunks,
                };
                if tx.send(chunk).await.is_err() {
                    return Ok(());
                }
            }
            Ok(())
        }
    }

    fn streamer(chunks: usize, delay: Duration) -> TtsStreamer {
        TtsStreamer::new(
            Arc::new(FakeTts { chunks, delay }),
            TtsStreamer::shared_cap(32),
            TtsStreamerConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_chunks_are_sequence_numbered() {
        let streamer = streamer(3, Duration::from_millis(1));
        let (tx, mut rx) = mpsc::channel(16);

        let generation = streamer.speak("hola", None, tx).await.unwrap();
        streamer.join().await;

        let mut seqs = Vec::new();
        while let Ok((g, chunk)) = rx.try_recv() {
            assert_eq!(g, generation);
            seqs.push(chunk.seq);
        }
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_new_speak_cancels_previous() {
        let streamer = streamer(100, Duration::from_millis(10));
        let (tx1, mut rx1) = mpsc::channel(256);
        let gen1 = streamer.speak("primera", None, tx1).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;

        let (tx2, _rx2) = mpsc::channel(256);
        let gen2 = streamer.speak("segunda", None, tx2).await.unwrap();
        assert!(gen2 > gen1);

        // Drain what the first synthesis produced; it must stop growing
        tokio::time::sleep(Duration::from_millis(50)).await;
        let drained: Vec<_> = std::iter::from_fn(|| rx1.try_recv().ok()).collect();
        assert!(drained.len() < 100);
    }

    #[tokio::test]
    async fn test_cancel_bumps_generation() {
        let streamer = streamer(10, Duration::from_millis(5));
        let before = streamer.generation();
        streamer.cancel();
        assert!(streamer.generation() > before);
    }

    #[tokio::test]
    async fn test_cap_exhaustion_is_overloaded() {
        let cap = TtsStreamer::shared_cap(0);
        let streamer = TtsStreamer::new(
            Arc::new(FakeTts {
                chunks: 1,
                delay: Duration::from_millis(1),
            }),
            cap,
            TtsStreamerConfig {
                cap_wait_ms: 20,
                ..Default::default()
            },
        );

        let (tx, _rx) = mpsc::channel(4);
        let err = streamer.speak("hola", None, tx).await.unwrap_err();
        assert_eq!(err.kind(), callweave_core::ErrorKind::Overloaded);
    }
}
