//! Preprocessor gateway
//!
//! Runs the configured subset of denoise, target-speaker extraction, and
//! prosody analysis on each segment, in that order. Every stage has its own
//! timeout; a stage that times out or errors is skipped, never retried, and
//! the pipeline continues with the best audio available. The gateway also
//! requests speaker-embedding creation once enough clean speech has
//! accumulated.

use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;
use std::time::{Duration, Instant};

use callweave_core::{
    AudioFrame, CallId, Denoiser, Error, ProsodyAnalyzer, ProsodyFeatures, Result, SampleRate,
    SpeakerExtractor,
};

use crate::ingress::Segment;
use crate::profile::VoiceProfileStore;

/// Gateway timeouts, per stage
#[derive(Debug, Clone)]
pub struct PreprocessTimeouts {
    pub denoise: Duration,
    pub extraction: Duration,
    pub prosody: Duration,
}

impl Default for PreprocessTimeouts {
    fn default() -> Self {
        Self {
            denoise: Duration::from_millis(400),
            extraction: Duration::from_millis(250),
            prosody: Duration::from_millis(150),
        }
    }
}

/// Gateway output for one segment
#[derive(Debug, Clone)]
pub struct PreprocessOutcome {
    /// The best audio available after enabled stages ran or were skipped
    pub samples: Vec<f32>,
    pub prosody: Option<ProsodyFeatures>,
    /// Denoise latency when the stage ran; None when skipped or disabled
    pub denoise_ms: Option<u64>,
    /// Stages that degraded (timed out or errored) on this segment
    pub degraded: Vec<&'static str>,
}

/// Preprocessor gateway; stages are optional per configuration
pub struct PreprocessorGateway {
    denoiser: Option<Arc<dyn Denoiser>>,
    extractor: Option<Arc<dyn SpeakerExtractor>>,
    prosody: Option<Arc<dyn ProsodyAnalyzer>>,
    timeouts: PreprocessTimeouts,
    profiles: Arc<VoiceProfileStore>,
    /// Clean speech required before an embedding is requested, ms
    profile_speech_ms: u64,
    /// Accumulated clean speech per call, ms
    accumulated_speech_ms: dashmap::DashMap<CallId, u64>,
}

impl PreprocessorGateway {
    pub fn new(
        denoiser: Option<Arc<dyn Denoiser>>,
        extractor: Option<Arc<dyn SpeakerExtractor>>,
        prosody: Option<Arc<dyn ProsodyAnalyzer>>,
        timeouts: PreprocessTimeouts,
        profiles: Arc<VoiceProfileStore>,
        profile_speech_ms: u64,
    ) -> Self {
        Self {
            denoiser,
            extractor,
            prosody,
            timeouts,
            profiles,
            profile_speech_ms,
            accumulated_speech_ms: dashmap::DashMap::new(),
        }
    }

    /// Process one segment for the given call
    pub async fn process(&self, call_id: CallId, segment: &Segment) -> PreprocessOutcome {
        let mut samples = segment.samples.clone();
        let mut degraded = Vec::new();
        let mut denoise_ms = None;

        // 1. Denoise
        if let Some(denoiser) = &self.denoiser {
            let start = Instant::now();
            match tokio::time::timeout(self.timeouts.denoise, denoiser.denoise(&samples)).await {
                Ok(Ok(clean)) => {
                    samples = clean;
                    denoise_ms = Some(start.elapsed().as_millis() as u64);
                }
                Ok(Err(e)) => {
                    tracing::warn!(call_id = %call_id, error = %e, "Denoise failed, skipping");
                    degraded.push("denoise");
                }
                Err(_) => {
                    tracing::warn!(call_id = %call_id, "Denoise timed out, skipping");
                    degraded.push("denoise");
                }
            }
        }

        // 2. Target-speaker extraction, or embedding creation
        if let Some(extractor) = &self.extractor {
            if let Some(embedding) = self.profiles.get(call_id) {
                match tokio::time::timeout(
                    self.timeouts.extraction,
                    extractor.extract(&samples, &embedding),
                )
                .await
                {
                    Ok(Ok(isolated)) => samples = isolated,
                    Ok(Err(e)) => {
                        tracing::warn!(call_id = %call_id, error = %e, "Extraction failed, skipping");
                        degraded.push("extraction");
                    }
                    Err(_) => {
                        tracing::warn!(call_id = %call_id, "Extraction timed out, skipping");
                        degraded.push("extraction");
                    }
                }
            } else {
                let accumulated = {
                    let mut entry = self.accumulated_speech_ms.entry(call_id).or_insert(0);
                    *entry += segment.speech_ms;
                    *entry
                };

                if accumulated >= self.profile_speech_ms {
                    match tokio::time::timeout(
                        self.timeouts.extraction,
                        extractor.create_embedding(&samples),
                    )
                    .await
                    {
                        Ok(Ok(embedding)) => {
                            if let Err(e) = self.profiles.create(call_id, embedding) {
                                tracing::error!(call_id = %call_id, error = %e, "Profile store rejected embedding");
                            }
                        }
                        Ok(Err(e)) => {
                            tracing::warn!(call_id = %call_id, error = %e, "Embedding creation failed");
                            degraded.push("extraction");
                        }
                        Err(_) => {
                            tracing::warn!(call_id = %call_id, "Embedding creation timed out");
                            degraded.push("extraction");
                        }
                    }
                }
            }
        }

        // 3. Prosody analysis
        let mut prosody_features = None;
        if let Some(analyzer) = &self.prosody {
            match tokio::time::timeout(self.timeouts.prosody, analyzer.analyze(&samples)).await {
                Ok(Ok(features)) => prosody_features = Some(features),
                Ok(Err(e)) => {
                    tracing::warn!(call_id = %call_id, error = %e, "Prosody failed, skipping");
                    degraded.push("prosody");
                }
                Err(_) => {
                    tracing::warn!(call_id = %call_id, "Prosody timed out, skipping");
                    degraded.push("prosody");
                }
            }
        }

        for stage in &degraded {
            metrics::counter!("preprocess_degraded_total", "stage" => *stage).increment(1);
        }

        PreprocessOutcome {
            samples,
            prosody: prosody_features,
            denoise_ms,
            degraded,
        }
    }

    /// Clear per-call accumulation at session close
    pub fn forget_call(&self, call_id: CallId) {
        self.accumulated_speech_ms.remove(&call_id);
    }
}

fn samples_to_pcm16(samples: &[f32]) -> Vec<u8> {
    AudioFrame::new(samples.to_vec(), SampleRate::Hz16000, 0).to_pcm16()
}

fn pcm16_to_samples(bytes: &[u8]) -> Vec<f32> {
    AudioFrame::from_pcm16(bytes, SampleRate::Hz16000, 0)
        .samples
        .to_vec()
}

/// HTTP denoise service (bytes in, bytes out)
pub struct HttpDenoiser {
    client: Client,
    url: String,
}

impl HttpDenoiser {
    pub fn new(client: Client, base_url: &str) -> Self {
        Self {
            client,
            url: format!("{}/denoise", base_url),
        }
    }
}

#[async_trait]
impl Denoiser for HttpDenoiser {
    async fn denoise(&self, samples: &[f32]) -> Result<Vec<f32>> {
        let response = self
            .client
            .post(&self.url)
            .header("content-type", "application/octet-stream")
            .body(samples_to_pcm16(samples))
            .send()
            .await
            .map_err(|e| Error::dependency("denoise", e))?;

        if !response.status().is_success() {
            return Err(Error::dependency(
                "denoise",
                format!("status {}", response.status()),
            ));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::dependency("denoise", e))?;
        Ok(pcm16_to_samples(&bytes))
    }
}

/// HTTP target-speaker extraction service
pub struct HttpSpeakerExtractor {
    client: Client,
    base_url: String,
}

impl HttpSpeakerExtractor {
    pub fn new(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.to_string(),
        }
    }
}

#[async_trait]
impl SpeakerExtractor for HttpSpeakerExtractor {
    async fn extract(&self, samples: &[f32], embedding: &[f32]) -> Result<Vec<f32>> {
        let body = serde_json::json!({
            "audio_pcm16_hex": hex_encode(&samples_to_pcm16(samples)),
            "embedding": embedding,
        });

        let response = self
            .client
            .post(format!("{}/extract", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::dependency("extraction", e))?;

        if !response.status().is_success() {
            return Err(Error::dependency(
                "extraction",
                format!("status {}", response.status()),
            ));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::dependency("extraction", e))?;
        Ok(pcm16_to_samples(&bytes))
    }

    async fn create_embedding(&self, samples: &[f32]) -> Result<Vec<f32>> {
        let response = self
            .client
            .post(format!("{}/embed", self.base_url))
            .header("content-type", "application/octet-stream")
            .body(samples_to_pcm16(samples))
            .send()
            .await
            .map_err(|e| Error::dependency("extraction", e))?;

        if !response.status().is_success() {
            return Err(Error::dependency(
                "extraction",
                format!("status {}", response.status()),
            ));
        }

        let embedding: Vec<f32> = response
            .json()
            .await
            .map_err(|e| Error::dependency("extraction", e))?;
        Ok(embedding)
    }
}

/// HTTP prosody analysis service
pub struct HttpProsodyAnalyzer {
    client: Client,
    url: String,
}

impl HttpProsodyAnalyzer {
    pub fn new(client: Client, base_url: &str) -> Self {
        Self {
            client,
            url: format!("{}/prosody", base_url),
        }
    }
}

#[async_trait]
impl ProsodyAnalyzer for HttpProsodyAnalyzer {
    async fn analyze(&self, samples: &[f32]) -> Result<ProsodyFeatures> {
        let response = self
            .client
            .post(&self.url)
            .header("content-type", "application/octet-stream")
            .body(samples_to_pcm16(samples))
            .send()
            .await
            .map_err(|e| Error::dependency("prosody", e))?;

        if !response.status().is_success() {
            return Err(Error::dependency(
                "prosody",
                format!("status {}", response.status()),
            ));
        }

        response
            .json()
            .await
            .map_err(|e| Error::dependency("prosody", e))
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use callweave_core::EmotionalTone;

    struct SlowDenoiser;

    #[async_trait]
    impl Denoiser for SlowDenoiser {
        async fn denoise(&self, _samples: &[f32]) -> Result<Vec<f32>> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(vec![])
        }
    }

    struct FixedProsody(ProsodyFeatures);

    #[async_trait]
    impl ProsodyAnalyzer for FixedProsody {
        async fn analyze(&self, _samples: &[f32]) -> Result<ProsodyFeatures> {
            Ok(self.0.clone())
        }
    }

    struct CountingExtractor;

    #[async_trait]
    impl SpeakerExtractor for CountingExtractor {
        async fn extract(&self, samples: &[f32], _embedding: &[f32]) -> Result<Vec<f32>> {
            Ok(samples.to_vec())
        }

        async fn create_embedding(&self, _samples: &[f32]) -> Result<Vec<f32>> {
            Ok(vec![0.5; crate::profile::EMBEDDING_DIM])
        }
    }

    fn segment(speech_ms: u64) -> Segment {
        Segment {
            samples: vec![0.2; 3200],
            duration_ms: 200,
            speech_ms,
            first_sequence: 0,
        }
    }

    #[tokio::test]
    async fn test_denoise_timeout_degrades_not_fails() {
        let gateway = PreprocessorGateway::new(
            Some(Arc::new(SlowDenoiser)),
            None,
            None,
            PreprocessTimeouts {
                denoise: Duration::from_millis(10),
                ..Default::default()
            },
            Arc::new(VoiceProfileStore::new()),
            3000,
        );

        let outcome = gateway.process(CallId::new(), &segment(200)).await;
        assert_eq!(outcome.degraded, vec!["denoise"]);
        assert!(outcome.denoise_ms.is_none());
        // Raw audio survives
        assert_eq!(outcome.samples.len(), 3200);
    }

    #[tokio::test]
    async fn test_prosody_features_returned() {
        let features = ProsodyFeatures {
            is_question: true,
            emotional_tone: EmotionalTone::Excited,
            has_speech: true,
            ..Default::default()
        };
        let gateway = PreprocessorGateway::new(
            None,
            None,
            Some(Arc::new(FixedProsody(features.clone()))),
            PreprocessTimeouts::default(),
            Arc::new(VoiceProfileStore::new()),
            3000,
        );

        let outcome = gateway.process(CallId::new(), &segment(200)).await;
        assert_eq!(outcome.prosody, Some(features));
        assert!(outcome.degraded.is_empty());
    }

    #[tokio::test]
    async fn test_embedding_created_after_enough_speech() {
        let profiles = Arc::new(VoiceProfileStore::new());
        let gateway = PreprocessorGateway::new(
            None,
            Some(Arc::new(CountingExtractor)),
            None,
            PreprocessTimeouts::default(),
            profiles.clone(),
            3000,
        );
        let call = CallId::new();

        // 2 segments of 1600ms: crosses the 3000ms bound on the second
        gateway.process(call, &segment(1600)).await;
        assert!(!profiles.exists(call));

        gateway.process(call, &segment(1600)).await;
        assert!(profiles.exists(call));
    }

    #[tokio::test]
    async fn test_no_stages_is_passthrough() {
        let gateway = PreprocessorGateway::new(
            None,
            None,
            None,
            PreprocessTimeouts::default(),
            Arc::new(VoiceProfileStore::new()),
            3000,
        );
        let outcome = gateway.process(CallId::new(), &segment(200)).await;
        assert!(outcome.degraded.is_empty());
        assert!(outcome.prosody.is_none());
        assert_eq!(outcome.samples.len(), 3200);
    }
}
