//! Typed settings tree
//!
//! Thresholds, timeouts and caps from the component specifications, with
//! the defaults they name. Every struct derives `Default` so partial
//! config files merge cleanly.

use serde::{Deserialize, Serialize};

/// Root settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerSettings,
    pub pipeline: PipelineSettings,
    pub correction: CorrectionSettings,
    pub caps: CapsSettings,
    pub services: ServiceSettings,
    pub webhooks: WebhookSettings,
    pub storage: StorageSettings,
    pub offline: OfflineSettings,
    pub scylla: ScyllaSettings,
}

/// HTTP server and auth
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Shared secret for `/api/admin` endpoints (`X-API-Key`)
    pub admin_key: Option<String>,
    /// Allowed CORS origins; empty list means same-origin only
    pub cors_origins: Vec<String>,
    pub cors_enabled: bool,
    /// Token lifetime granted at creation, days
    pub token_ttl_days: i64,
    /// Shutdown drain window for active sessions, seconds
    pub shutdown_grace_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            admin_key: None,
            cors_origins: Vec::new(),
            cors_enabled: true,
            token_ttl_days: 90,
            shutdown_grace_secs: 30,
        }
    }
}

/// Audio pipeline thresholds and timers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    /// Ring buffer length backing prosody analysis, ms
    pub prosody_window_ms: u64,
    /// Forward silence that closes a segment, ms
    pub min_silence_ms: u64,
    /// Hard bound on segment duration, ms
    pub max_segment_ms: u64,
    /// Segments shorter than this are not sent to STT, ms
    pub min_speech_ms: u64,
    /// Silence that ends the user's turn, ms
    pub end_of_turn_pause_ms: u64,
    /// Shortened end-of-turn pause when prosody says question, ms
    pub end_of_turn_pause_question_ms: u64,
    /// Thinking-pause window bounds, ms
    pub thinking_pause_min_ms: u64,
    pub thinking_pause_max_ms: u64,
    /// Energy threshold for voice activity, dB
    pub vad_threshold_db: f32,
    /// Sustained speech needed to raise an interruption, ms
    pub barge_in_min_speech_ms: u64,
    /// Queue depth for STT segments beyond the in-flight one
    pub stt_queue_depth: usize,
    /// STT wall-clock budget per 8 s of audio, ms
    pub stt_timeout_per_8s_ms: u64,
    /// Per-stage preprocessing timeouts, ms
    pub denoise_timeout_ms: u64,
    pub extraction_timeout_ms: u64,
    pub prosody_timeout_ms: u64,
    /// Clean speech required before requesting a speaker embedding, ms
    pub profile_speech_ms: u64,
    /// Soft target for first synthesized byte, ms
    pub tts_first_byte_target_ms: u64,
    /// Bound on dialogue memory, in user/assistant pairs
    pub max_context_turns: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            prosody_window_ms: 1500,
            min_silence_ms: 500,
            max_segment_ms: 8000,
            min_speech_ms: 250,
            end_of_turn_pause_ms: 1500,
            end_of_turn_pause_question_ms: 600,
            thinking_pause_min_ms: 800,
            thinking_pause_max_ms: 2500,
            vad_threshold_db: -40.0,
            barge_in_min_speech_ms: 150,
            stt_queue_depth: 2,
            stt_timeout_per_8s_ms: 3000,
            denoise_timeout_ms: 400,
            extraction_timeout_ms: 250,
            prosody_timeout_ms: 150,
            profile_speech_ms: 3000,
            tts_first_byte_target_ms: 400,
            max_context_turns: 10,
        }
    }
}

/// Online corrector and clarification
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrectionSettings {
    /// Hard per-segment budget, ms
    pub budget_ms: u64,
    pub clarification_confidence_threshold: f32,
    pub max_clarifications_per_call: u32,
}

impl Default for CorrectionSettings {
    fn default() -> Self {
        Self {
            budget_ms: 20,
            clarification_confidence_threshold: 0.6,
            max_clarifications_per_call: 3,
        }
    }
}

/// Process-wide capacity caps
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CapsSettings {
    pub stt_in_flight_cap: usize,
    pub tts_in_flight_cap: usize,
    pub webhook_workers: usize,
    /// Bounded wait before a capped request fails Overloaded, ms
    pub cap_wait_ms: u64,
}

impl Default for CapsSettings {
    fn default() -> Self {
        Self {
            stt_in_flight_cap: 32,
            tts_in_flight_cap: 32,
            webhook_workers: 16,
            cap_wait_ms: 500,
        }
    }
}

/// External service endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    pub stt_url: String,
    pub tts_url: String,
    pub llm_url: String,
    pub denoise_url: String,
    pub extraction_url: String,
    pub prosody_url: String,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            stt_url: "http://localhost:9001".to_string(),
            tts_url: "http://localhost:9002".to_string(),
            llm_url: "http://localhost:9003".to_string(),
            denoise_url: "http://localhost:9004".to_string(),
            extraction_url: "http://localhost:9005".to_string(),
            prosody_url: "http://localhost:9006".to_string(),
        }
    }
}

/// Webhook delivery policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookSettings {
    pub queue_cap: usize,
    pub max_attempts: u32,
    /// First retry delay, seconds; each retry multiplies by `backoff_factor`
    pub backoff_base_secs: u64,
    pub backoff_factor: u64,
    /// Minimum interval between sentiment alerts per call, seconds
    pub sentiment_alert_interval_secs: u64,
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self {
            queue_cap: 1000,
            max_attempts: 5,
            backoff_base_secs: 1,
            backoff_factor: 5,
            sentiment_alert_interval_secs: 30,
        }
    }
}

/// Recording storage backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    #[default]
    Local,
    Remote,
    /// Local authoritative, remote best-effort
    DualWrite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    pub mode: StorageMode,
    pub local_root: String,
    /// Object-store base URL for remote/dual-write modes
    pub remote_url: Option<String>,
    /// Retry window for the close-time write before the call errors, ms
    pub close_retry_window_ms: u64,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            mode: StorageMode::Local,
            local_root: "data".to_string(),
            remote_url: None,
            close_retry_window_ms: 10_000,
        }
    }
}

/// Offline enrichment thresholds consumed by the batch worker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OfflineSettings {
    /// Estimated WER above which the worker retranscribes
    pub wer_retranscribe_threshold: f32,
    /// Cosine distance bound for vector dictionary matches
    pub vector_distance_threshold: f32,
}

impl Default for OfflineSettings {
    fn default() -> Self {
        Self {
            wer_retranscribe_threshold: 0.2,
            vector_distance_threshold: 0.7,
        }
    }
}

/// ScyllaDB connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScyllaSettings {
    pub hosts: Vec<String>,
    pub keyspace: String,
    pub replication_factor: u8,
}

impl Default for ScyllaSettings {
    fn default() -> Self {
        Self {
            hosts: vec!["127.0.0.1:9042".to_string()],
            keyspace: "callweave".to_string(),
            replication_factor: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_defaults() {
        let s = Settings::default();
        assert_eq!(s.pipeline.min_silence_ms, 500);
        assert_eq!(s.pipeline.max_segment_ms, 8000);
        assert_eq!(s.pipeline.min_speech_ms, 250);
        assert_eq!(s.pipeline.end_of_turn_pause_ms, 1500);
        assert_eq!(s.pipeline.end_of_turn_pause_question_ms, 600);
        assert_eq!(s.correction.max_clarifications_per_call, 3);
        assert!((s.correction.clarification_confidence_threshold - 0.6).abs() < f32::EPSILON);
        assert_eq!(s.webhooks.queue_cap, 1000);
        assert_eq!(s.webhooks.max_attempts, 5);
        assert_eq!(s.caps.webhook_workers, 16);
        assert!((s.offline.wer_retranscribe_threshold - 0.2).abs() < f32::EPSILON);
    }

    #[test]
    fn test_partial_toml_merges_over_defaults() {
        let partial: Settings = toml::from_str(
            r#"
            [pipeline]
            end_of_turn_pause_ms = 1200

            [storage]
            mode = "dual_write"
            "#,
        )
        .unwrap();

        assert_eq!(partial.pipeline.end_of_turn_pause_ms, 1200);
        // Untouched fields keep their defaults
        assert_eq!(partial.pipeline.min_silence_ms, 500);
        assert_eq!(partial.storage.mode, StorageMode::DualWrite);
    }

    #[test]
    fn test_backoff_schedule_shape() {
        let w = WebhookSettings::default();
        let mut delay = w.backoff_base_secs;
        let mut schedule = Vec::new();
        for _ in 0..w.max_attempts {
            schedule.push(delay);
            delay *= w.backoff_factor;
        }
        assert_eq!(schedule, vec![1, 5, 25, 125, 625]);
    }
}
