//! Application state
//!
//! Everything handlers need, constructed explicitly at startup and passed
//! through axum's state extension. No process-wide singletons.

use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::Semaphore;

use callweave_config::{load_settings, Settings};
use callweave_llm::{DialogueBackend, DialogueConfig};
use callweave_persistence::PersistenceLayer;
use callweave_pipeline::preprocess::PreprocessTimeouts;
use callweave_pipeline::stt::SttConfig;
use callweave_pipeline::{
    HttpDenoiser, HttpProsodyAnalyzer, HttpSpeakerExtractor, HttpSttService, HttpTtsService,
    PreprocessorGateway, SttAdapter, VoiceProfileStore,
};
use callweave_session::{PersistenceBackend, RunnerDeps, SessionRegistry};
use callweave_storage::{HttpBlobStore, RecordingStore};
use callweave_text_processing::{
    Clarifier, CorrectionDictionary, CriticalCategories, OnlineCorrector, SentimentFuser,
};
use callweave_tools::ToolRegistry;
use callweave_webhooks::{Dispatcher, DispatcherConfig, HttpTransport, SentimentAlertLimiter};

use callweave_config::StorageMode;
use callweave_core::{CallId, OrgId};
use callweave_persistence::{AuditKind, AuditStore, WebhookDeliveryRow, WebhookStore};
use callweave_session::AuditSink;
use callweave_webhooks::{AttemptOutcome, DeliveryLog, DeliveryRecord};

/// Audit sink recording cross-tenant lookups into the persistence layer
pub struct PersistenceAudit {
    pub audit: AuditStore,
}

#[async_trait::async_trait]
impl AuditSink for PersistenceAudit {
    async fn cross_tenant_attempt(&self, org: OrgId, call: CallId) {
        self.audit
            .record(
                org,
                AuditKind::CrossTenantAttempt,
                &format!("call {}", call),
            )
            .await;
    }
}

/// Delivery log persisting the webhook attempt trail
struct PersistenceDeliveryLog {
    webhooks: WebhookStore,
}

#[async_trait::async_trait]
impl DeliveryLog for PersistenceDeliveryLog {
    async fn record(&self, record: DeliveryRecord) {
        let last_status = match record.outcome {
            AttemptOutcome::Delivered => Some("delivered".to_string()),
            AttemptOutcome::Dead => Some("dead".to_string()),
            AttemptOutcome::Failed => record.status.map(|s| s.to_string()),
        };

        let row = WebhookDeliveryRow::attempt(
            record.org_id,
            record.webhook_id,
            record.event_type.as_str(),
            record.attempt as i32,
            last_status,
            None,
        );

        if let Err(e) = self.webhooks.record_delivery(&row).await {
            tracing::warn!(error = %e, "Delivery trail write failed");
        }
    }
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Configuration behind a lock for hot reload
    pub config: Arc<RwLock<Settings>>,
    pub persistence: Arc<PersistenceLayer>,
    pub registry: Arc<SessionRegistry>,
    pub dispatcher: Arc<Dispatcher>,
    pub dictionary: Arc<CorrectionDictionary>,
    pub recordings: Arc<RecordingStore>,
    pub stt: Arc<dyn callweave_core::SpeechToText>,
    /// Everything a call runner needs, cloned per call
    pub runner_deps: RunnerDeps,
    /// Prometheus render handle, installed by main
    pub metrics_handle: Option<metrics_exporter_prometheus::PrometheusHandle>,
    /// Environment name for config reload
    env: Option<String>,
}

impl AppState {
    /// Wire the full component graph from settings and a connected
    /// persistence layer.
    pub fn new(
        settings: Settings,
        persistence: Arc<PersistenceLayer>,
        env: Option<String>,
    ) -> Result<Self, crate::ServerError> {
        let http_client = reqwest::Client::new();

        let dispatcher = Arc::new(Dispatcher::new(
            DispatcherConfig {
                queue_cap: settings.webhooks.queue_cap,
                max_attempts: settings.webhooks.max_attempts,
                backoff_base_secs: settings.webhooks.backoff_base_secs,
                backoff_factor: settings.webhooks.backoff_factor,
                worker_slots: settings.caps.webhook_workers,
            },
            Arc::new(HttpTransport::new(http_client.clone())),
            Some(Arc::new(PersistenceDeliveryLog {
                webhooks: persistence.webhooks.clone(),
            })),
        ));

        let registry = Arc::new(SessionRegistry::new(
            Arc::new(PersistenceBackend {
                agents: persistence.agents.clone(),
                calls: persistence.calls.clone(),
            }),
            dispatcher.clone(),
            Some(Arc::new(PersistenceAudit {
                audit: persistence.audit.clone(),
            })),
        ));

        let dictionary = Arc::new(CorrectionDictionary::seeded());
        let profiles = Arc::new(VoiceProfileStore::new());

        let stt_service: Arc<dyn callweave_core::SpeechToText> = Arc::new(HttpSttService::new(
            http_client.clone(),
            &settings.services.stt_url,
        ));

        let remote = match settings.storage.mode {
            StorageMode::Local => None,
            StorageMode::Remote | StorageMode::DualWrite => settings
                .storage
                .remote_url
                .as_deref()
                .map(|url| {
                    Arc::new(HttpBlobStore::new(http_client.clone(), url))
                        as Arc<dyn callweave_storage::BlobStore>
                }),
        };
        let recordings = Arc::new(RecordingStore::new(
            settings.storage.local_root.clone(),
            remote,
        ));

        let preprocess = Arc::new(PreprocessorGateway::new(
            Some(Arc::new(HttpDenoiser::new(
                http_client.clone(),
                &settings.services.denoise_url,
            ))),
            Some(Arc::new(HttpSpeakerExtractor::new(
                http_client.clone(),
                &settings.services.extraction_url,
            ))),
            Some(Arc::new(HttpProsodyAnalyzer::new(
                http_client.clone(),
                &settings.services.prosody_url,
            ))),
            PreprocessTimeouts {
                denoise: std::time::Duration::from_millis(settings.pipeline.denoise_timeout_ms),
                extraction: std::time::Duration::from_millis(
                    settings.pipeline.extraction_timeout_ms,
                ),
                prosody: std::time::Duration::from_millis(settings.pipeline.prosody_timeout_ms),
            },
            profiles.clone(),
            settings.pipeline.profile_speech_ms,
        ));

        let dialogue = Arc::new(
            DialogueBackend::new(DialogueConfig {
                endpoint: settings.services.llm_url.clone(),
                ..Default::default()
            })
            .map_err(callweave_core::Error::from)?,
        );

        let runner_deps = RunnerDeps {
            settings: settings.clone(),
            stt: Arc::new(SttAdapter::new(
                stt_service.clone(),
                settings.caps.stt_in_flight_cap,
                SttConfig {
                    timeout_per_8s_ms: settings.pipeline.stt_timeout_per_8s_ms,
                    cap_wait_ms: settings.caps.cap_wait_ms,
                    queue_depth: settings.pipeline.stt_queue_depth,
                },
            )),
            tts_service: Arc::new(HttpTtsService::new(
                http_client.clone(),
                &settings.services.tts_url,
            )),
            tts_cap: Arc::new(Semaphore::new(settings.caps.tts_in_flight_cap)),
            dialogue,
            preprocess,
            profiles,
            corrector: Arc::new(OnlineCorrector::new(
                dictionary.clone(),
                settings.correction.budget_ms,
            )),
            clarifier: Arc::new(Clarifier::new(
                CriticalCategories::default(),
                settings.correction.clarification_confidence_threshold,
                settings.correction.max_clarifications_per_call,
            )),
            fuser: Arc::new(SentimentFuser::default()),
            tools: Arc::new(ToolRegistry::new()),
            recordings: recordings.clone(),
            sink: Arc::new(persistence.calls.clone()),
            dispatcher: dispatcher.clone(),
            alerts: Arc::new(SentimentAlertLimiter::new(std::time::Duration::from_secs(
                settings.webhooks.sentiment_alert_interval_secs,
            ))),
            context_profile: "Eres un asistente de atención al cliente. Responde de forma breve y natural."
                .to_string(),
        };

        Ok(Self {
            config: Arc::new(RwLock::new(settings)),
            persistence,
            registry,
            dispatcher,
            dictionary,
            recordings,
            stt: stt_service,
            runner_deps,
            metrics_handle: None,
            env,
        })
    }

    pub fn with_metrics_handle(
        mut self,
        handle: metrics_exporter_prometheus::PrometheusHandle,
    ) -> Self {
        self.metrics_handle = Some(handle);
        self
    }

    /// Reload configuration from disk; pipeline components keep their
    /// startup values, HTTP-facing settings pick up the new ones.
    pub fn reload_config(&self) -> Result<(), String> {
        let new_config = load_settings(self.env.as_deref())
            .map_err(|e| format!("Failed to reload config: {}", e))?;

        *self.config.write() = new_config;
        tracing::info!("Configuration reloaded");
        Ok(())
    }

    /// Load every persisted webhook subscription into the dispatcher
    pub async fn restore_webhooks(&self, orgs: &[callweave_core::OrgId]) {
        for org in orgs {
            match self.persistence.webhooks.list(*org).await {
                Ok(records) => {
                    for record in records {
                        self.dispatcher
                            .upsert_subscription(crate::http::subscription_from_record(&record));
                    }
                }
                Err(e) => {
                    tracing::warn!(org_id = %org, error = %e, "Webhook restore failed");
                }
            }
        }
    }
}
