//! Per-call pipeline runner
//!
//! Drives one call end to end: bridge frames in, segments through the
//! preprocessor and STT, the online corrector and clarifier, sentiment
//! fusion, the turn state machine, the dialogue engine, sentence-chunked
//! synthesis, and playback. External failures degrade the call; invariant
//! violations end it with `error` status.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;

use callweave_config::Settings;
use callweave_core::{
    AudioFrame, CallEvent, CallOutcome, ContextFlags, DialogueEvent, DialogueStream, Error,
    EventEnvelope, FusedSentiment, ProsodyFeatures, Result, SampleRate, TextToSpeech, Transcript,
    TranscriptionResult, Turn, TurnLatencies, TurnRole, WebhookEvent, WordConfidence,
};
use callweave_llm::{ConversationMemory, PromptAssembler};
use callweave_persistence::CallStore;
use callweave_pipeline::{
    processors::{InterruptHandler, InterruptHandlerConfig, SentenceDetector, SentenceDetectorConfig},
    AudioIngress, IngressConfig, IngressEvent, PlaybackController, PreprocessorGateway, Segment,
    SessionBus, SessionSignal, SttAdapter, SttQueue, SttSubmit, TtsStreamer, TurnController,
    TurnPhase, VoiceActivity, VoiceProfileStore,
};
use callweave_pipeline::stt::SttJob;
use callweave_pipeline::tts::TtsStreamerConfig;
use callweave_pipeline::turn::TurnConfig;
use callweave_storage::{
    Metadata, ProcessingMetrics, ProcessingMode, RecordingStore, SentimentBlock,
    TranscriptionBlock, TurnSummary,
};
use callweave_text_processing::{
    ClarificationOutcome, Clarifier, ContextDetector, OnlineCorrector, SentimentFuser,
};
use callweave_tools::{ToolInvocation, ToolKind, ToolRegistry};
use callweave_core::frame::{ControlFrame, Frame, FrameProcessor, ProcessorContext};
use callweave_webhooks::{Dispatcher, SentimentAlertLimiter};

use crate::session::Session;

/// Maximum "could you repeat" fallbacks before the call is handed off
const MAX_STT_APOLOGIES: u32 = 2;

/// Sink for persisted turns and stage events; fakes replace it in tests
#[async_trait]
pub trait TurnSink: Send + Sync {
    async fn append_turn(&self, session: &Session, index: i32, turn: &Turn);

    async fn append_event(&self, event: &CallEvent);
}

/// No-op sink
pub struct NullSink;

#[async_trait]
impl TurnSink for NullSink {
    async fn append_turn(&self, _session: &Session, _index: i32, _turn: &Turn) {}
    async fn append_event(&self, _event: &CallEvent) {}
}

#[async_trait]
impl TurnSink for CallStore {
    async fn append_turn(&self, session: &Session, index: i32, turn: &Turn) {
        if let Err(e) = CallStore::append_turn(self, session.org_id, session.call_id, index, turn).await
        {
            tracing::warn!(error = %e, "Turn persist failed");
        }
    }

    async fn append_event(&self, event: &CallEvent) {
        if let Err(e) = CallStore::append_event(self, event).await {
            tracing::warn!(error = %e, "Event persist failed");
        }
    }
}

/// Everything a runner needs, constructed once per process and shared
#[derive(Clone)]
pub struct RunnerDeps {
    pub settings: Settings,
    pub stt: Arc<SttAdapter>,
    pub tts_service: Arc<dyn TextToSpeech>,
    pub tts_cap: Arc<Semaphore>,
    pub dialogue: Arc<dyn DialogueStream>,
    pub preprocess: Arc<PreprocessorGateway>,
    pub profiles: Arc<VoiceProfileStore>,
    pub corrector: Arc<OnlineCorrector>,
    pub clarifier: Arc<Clarifier>,
    pub fuser: Arc<SentimentFuser>,
    pub tools: Arc<ToolRegistry>,
    pub recordings: Arc<RecordingStore>,
    pub sink: Arc<dyn TurnSink>,
    pub dispatcher: Arc<Dispatcher>,
    pub alerts: Arc<SentimentAlertLimiter>,
    /// Agent context profile (base system prompt)
    pub context_profile: String,
}

/// Inputs fed by the bridge endpoint
#[derive(Debug)]
pub enum RunnerInput {
    Audio(AudioFrame),
    Dtmf(char),
    Metadata(serde_json::Value),
    Hangup,
}

/// Shared pieces the assistant-response task needs
#[derive(Clone)]
struct RespondCtx {
    session: Arc<Session>,
    dialogue: Arc<dyn DialogueStream>,
    tools: Arc<ToolRegistry>,
    tts: Arc<TtsStreamer>,
    playback: Arc<PlaybackController>,
    turn_ctl: Arc<TurnController>,
    dispatcher: Arc<Dispatcher>,
    sink: Arc<dyn TurnSink>,
    turns: Arc<Mutex<Vec<Turn>>>,
    memory: Arc<Mutex<ConversationMemory>>,
    accum: Arc<Mutex<String>>,
    turn_index: Arc<Mutex<i32>>,
    bus: SessionBus,
}

/// The per-call runner
pub struct CallRunner {
    session: Arc<Session>,
    deps: RunnerDeps,
    /// Carries the playback→ingress interruption edge and other
    /// cross-component signals without back-pointers
    bus: SessionBus,
    ingress: AudioIngress,
    turn_ctl: Arc<TurnController>,
    playback: Arc<PlaybackController>,
    tts: Arc<TtsStreamer>,
    /// Created when the runner starts; None before that
    stt_queue: Option<SttQueue>,
    /// Submission instants, FIFO with results
    stt_submitted: VecDeque<Instant>,
    /// Jobs submitted and not yet answered
    stt_outstanding: usize,
    /// End-of-turn fired; commit once STT drains
    awaiting_commit: bool,
    pending_text: Vec<String>,
    pending_words: Vec<WordConfidence>,
    pending_corrections: Vec<(String, String)>,
    pending_denoise_ms: Option<u64>,
    pending_stt_ms: Vec<u64>,
    last_prosody: Option<ProsodyFeatures>,
    turns: Arc<Mutex<Vec<Turn>>>,
    memory: Arc<Mutex<ConversationMemory>>,
    context: ContextDetector,
    /// Rolling fused scores of the last user turns
    sentiment_window: VecDeque<f32>,
    /// Full-call inbound audio at the canonical rate
    captured_audio: Vec<f32>,
    assistant_accum: Arc<Mutex<String>>,
    respond_task: Option<JoinHandle<()>>,
    turn_index: Arc<Mutex<i32>>,
    stt_failures: u32,
    pending_end: Option<CallOutcome>,
}

impl CallRunner {
    /// `egress` carries synthesized audio frames back to the bridge
    pub fn new(session: Arc<Session>, deps: RunnerDeps, egress: mpsc::Sender<AudioFrame>) -> Self {
        let pipeline = &deps.settings.pipeline;

        let ingress = AudioIngress::new(IngressConfig {
            prosody_window_ms: pipeline.prosody_window_ms,
            min_silence_ms: pipeline.min_silence_ms,
            max_segment_ms: pipeline.max_segment_ms,
            min_speech_ms: pipeline.min_speech_ms,
            vad_threshold_db: pipeline.vad_threshold_db,
            barge_in_min_speech_ms: pipeline.barge_in_min_speech_ms,
        });

        let turn_ctl = Arc::new(TurnController::new(TurnConfig {
            end_of_turn_pause_ms: pipeline.end_of_turn_pause_ms,
            end_of_turn_pause_question_ms: pipeline.end_of_turn_pause_question_ms,
            thinking_pause_min_ms: pipeline.thinking_pause_min_ms,
            thinking_pause_max_ms: pipeline.thinking_pause_max_ms,
        }));

        let playback = Arc::new(PlaybackController::new(egress));
        let tts = Arc::new(TtsStreamer::new(
            deps.tts_service.clone(),
            deps.tts_cap.clone(),
            TtsStreamerConfig {
                first_byte_target_ms: pipeline.tts_first_byte_target_ms,
                ..Default::default()
            },
        ));

        let memory = ConversationMemory::new(pipeline.max_context_turns);

        Self {
            session,
            bus: SessionBus::new(),
            ingress,
            turn_ctl,
            playback,
            tts,
            stt_queue: None,
            stt_submitted: VecDeque::new(),
            stt_outstanding: 0,
            awaiting_commit: false,
            pending_text: Vec::new(),
            pending_words: Vec::new(),
            pending_corrections: Vec::new(),
            pending_denoise_ms: None,
            pending_stt_ms: Vec::new(),
            last_prosody: None,
            turns: Arc::new(Mutex::new(Vec::new())),
            memory: Arc::new(Mutex::new(memory)),
            context: ContextDetector::default(),
            sentiment_window: VecDeque::with_capacity(4),
            captured_audio: Vec::new(),
            assistant_accum: Arc::new(Mutex::new(String::new())),
            respond_task: None,
            turn_index: Arc::new(Mutex::new(0)),
            stt_failures: 0,
            pending_end: None,
            deps,
        }
    }

    /// Drive the call until the bridge closes, the caller hangs up, or the
    /// session is cancelled. Returns the outcome the registry should close
    /// the call with.
    pub async fn run(mut self, mut input: mpsc::Receiver<RunnerInput>) -> CallOutcome {
        let mut outcome = CallOutcome::Completed;
        let cancel = self.session.cancel.clone();

        let (result_tx, mut stt_rx) = mpsc::channel(8);
        let stt_params = json!({
            "conversation_id": self.session.call_id.to_string(),
            "enable_correction": false,
            "enable_clarification": false,
        });
        self.stt_queue = Some(SttQueue::spawn(
            self.deps.stt.clone(),
            stt_params,
            result_tx,
        ));

        loop {
            if let Some(end) = self.pending_end.take() {
                outcome = end;
                break;
            }

            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    break;
                }

                maybe = input.recv() => match maybe {
                    None => {
                        outcome = CallOutcome::BridgeClosed;
                        break;
                    }
                    Some(RunnerInput::Hangup) => {
                        break;
                    }
                    Some(RunnerInput::Dtmf(digit)) => {
                        self.bus.publish(SessionSignal::Dtmf(digit));
                        self.deps
                            .sink
                            .append_event(
                                &CallEvent::stage(self.session.call_id, self.session.org_id, "dtmf")
                                    .with_parameters(json!({ "digit": digit })),
                            )
                            .await;
                    }
                    Some(RunnerInput::Metadata(_)) => {}
                    Some(RunnerInput::Audio(frame)) => {
                        if let Err(e) = self.on_audio(frame).await {
                            if self.handle_error(e).await {
                                outcome = CallOutcome::Failed;
                                break;
                            }
                        }
                    }
                },

                Some(result) = stt_rx.recv() => {
                    if let Err(e) = self.on_transcription(result).await {
                        if self.handle_error(e).await {
                            outcome = CallOutcome::Failed;
                            break;
                        }
                    }
                }
            }
        }

        self.finish(&mut outcome).await;
        outcome
    }

    /// Returns true when the error is fatal to the session
    async fn handle_error(&mut self, error: Error) -> bool {
        if error.kind().is_session_fatal() {
            tracing::error!(call_id = %self.session.call_id, error = %error, "Session-fatal error");
            self.deps
                .sink
                .append_event(
                    &CallEvent::stage(self.session.call_id, self.session.org_id, "error")
                        .with_parameters(json!({ "message": error.to_string() })),
                )
                .await;
            self.deps.dispatcher.enqueue(&EventEnvelope::new(
                WebhookEvent::Error,
                self.session.call_id,
                self.session.org_id,
                json!({ "message": error.to_string() }),
            ));
            true
        } else {
            tracing::warn!(call_id = %self.session.call_id, error = %error, "Degraded");
            false
        }
    }

    async fn on_audio(&mut self, frame: AudioFrame) -> Result<()> {
        // Capture the call audio for the recording artifact
        let canonical = if frame.sample_rate == SampleRate::Hz16000 {
            frame.clone()
        } else {
            frame.resample(SampleRate::Hz16000)
        };
        self.captured_audio.extend(canonical.samples.iter());

        let speaking = self.playback.is_speaking();
        let events = self.ingress.push_frame(&frame, speaking);

        let activity = if frame.energy_db >= self.deps.settings.pipeline.vad_threshold_db {
            VoiceActivity::Speech
        } else {
            VoiceActivity::Silence
        };
        let update = self.turn_ctl.process(activity, self.ingress.silence_run_ms());

        if update.end_of_turn {
            // Explicit flush from the turn controller
            if let Some(segment) = self.ingress.flush() {
                self.on_segment(segment).await?;
            }
            self.awaiting_commit = true;
            self.try_commit().await?;
        }

        for event in events {
            match event {
                IngressEvent::SpeechStarted => {
                    tracing::trace!(call_id = %self.session.call_id, "Speech started");
                }
                IngressEvent::Interruption { energy_db } => {
                    self.on_interruption(energy_db).await?;
                }
                IngressEvent::SegmentReady(segment) => {
                    self.on_segment(segment).await?;
                }
            }
        }

        Ok(())
    }

    async fn on_segment(&mut self, segment: Segment) -> Result<()> {
        if !segment.has_enough_speech(self.deps.settings.pipeline.min_speech_ms) {
            tracing::debug!(
                speech_ms = segment.speech_ms,
                "Segment below min speech, not sent to STT"
            );
            return Ok(());
        }

        let outcome = self
            .deps
            .preprocess
            .process(self.session.call_id, &segment)
            .await;

        for stage in &outcome.degraded {
            self.deps
                .sink
                .append_event(
                    &CallEvent::stage(
                        self.session.call_id,
                        self.session.org_id,
                        "dependency_degraded",
                    )
                    .with_parameters(json!({ "stage": stage })),
                )
                .await;
        }

        if let Some(prosody) = &outcome.prosody {
            self.turn_ctl.update_prosody(prosody);
            self.last_prosody = Some(prosody.clone());
        }
        if outcome.denoise_ms.is_some() {
            self.pending_denoise_ms = outcome.denoise_ms;
        }

        let Some(queue) = &self.stt_queue else {
            return Err(Error::invariant("segment before runner start"));
        };

        match queue.submit(SttJob {
            samples: outcome.samples,
            duration_ms: segment.duration_ms,
        }) {
            SttSubmit::Accepted => {
                self.stt_submitted.push_back(Instant::now());
                self.stt_outstanding += 1;
            }
            SttSubmit::Dropped => {
                self.deps
                    .sink
                    .append_event(
                        &CallEvent::stage(self.session.call_id, self.session.org_id, "stt_dropped")
                            .with_parameters(json!({ "duration_ms": segment.duration_ms })),
                    )
                    .await;
            }
        }

        Ok(())
    }

    async fn on_transcription(&mut self, result: Result<TranscriptionResult>) -> Result<()> {
        let submitted = self.stt_submitted.pop_front();
        self.stt_outstanding = self.stt_outstanding.saturating_sub(1);

        match result {
            Ok(transcription) => {
                if let Some(at) = submitted {
                    self.pending_stt_ms.push(at.elapsed().as_millis() as u64);
                }

                if !transcription.text.trim().is_empty() {
                    let corrected = self
                        .deps
                        .corrector
                        .correct(&transcription.text, &transcription.words);

                    self.pending_text.push(corrected.text);
                    self.pending_words.extend(corrected.words);
                    self.pending_corrections.extend(
                        corrected
                            .corrections
                            .into_iter()
                            .map(|c| (c.original, c.corrected)),
                    );
                }
            }
            Err(e) => {
                self.deps
                    .sink
                    .append_event(
                        &CallEvent::stage(
                            self.session.call_id,
                            self.session.org_id,
                            "dependency_degraded",
                        )
                        .with_parameters(json!({ "stage": "stt", "message": e.to_string() })),
                    )
                    .await;
                self.stt_failures += 1;

                if self.stt_failures > MAX_STT_APOLOGIES {
                    // Give up gracefully: transfer when a handler exists,
                    // otherwise end the call
                    self.pending_end = Some(if self.deps.tools.has(ToolKind::TransferToAgent) {
                        CallOutcome::Transferred
                    } else {
                        CallOutcome::Completed
                    });
                    return Ok(());
                }

                self.abandon_pending_turn();
                self.spawn_speak_text("Perdona, no te he entendido. ¿Puedes repetirlo?", None);
                return Ok(());
            }
        }

        self.try_commit().await
    }

    /// Commit once end-of-turn fired and every submitted segment came back
    async fn try_commit(&mut self) -> Result<()> {
        if !self.awaiting_commit || self.stt_outstanding > 0 {
            return Ok(());
        }
        self.awaiting_commit = false;

        let text = self.pending_text.join(" ");
        let words = std::mem::take(&mut self.pending_words);
        let corrections = std::mem::take(&mut self.pending_corrections);
        let stt_ms = std::mem::take(&mut self.pending_stt_ms);
        let denoise_ms = self.pending_denoise_ms.take();
        self.pending_text.clear();

        if text.trim().is_empty() {
            self.abandon_pending_turn();
            return Ok(());
        }

        // Clarification evaluation before anything is committed
        match self
            .deps
            .clarifier
            .evaluate(&words, self.session.clarifications())
        {
            ClarificationOutcome::Clarify(request) => {
                self.session.record_clarification();
                self.turn_ctl
                    .begin_clarifying()
                    .map_err(callweave_core::Error::from)?;

                self.deps
                    .sink
                    .append_event(
                        &CallEvent::stage(
                            self.session.call_id,
                            self.session.org_id,
                            "clarification",
                        )
                        .with_parameters(json!({
                            "word": request.word,
                            "category": request.category,
                            "strategy": request.strategy,
                        })),
                    )
                    .await;

                let turn_ctl = self.turn_ctl.clone();
                self.spawn_speak_text(&request.prompt, Some(Box::new(move || {
                    if let Err(e) = turn_ctl.clarification_done() {
                        tracing::warn!(error = %e, "Clarification completion transition failed");
                    }
                })));
                return Ok(());
            }
            ClarificationOutcome::Commit => {}
        }

        // The word list must still spell the transcript text after
        // correction (whitespace-normalized)
        let transcript = Transcript::new(text.clone(), words);
        if !transcript.words.is_empty() && !transcript.is_consistent() {
            return Err(Error::invariant(
                "turn word list diverges from transcript text",
            ));
        }
        let confidence = transcript.confidence_avg();

        // Sentiment fusion and context flags
        let prosody = self.last_prosody.clone().unwrap_or_default();
        let sentiment = self.deps.fuser.fuse(&text, &prosody);
        let flags = self.context.push_turn(&text);

        if self.sentiment_window.len() == 4 {
            self.sentiment_window.pop_front();
        }
        self.sentiment_window.push_back(sentiment.score);

        let total_ms: u64 =
            stt_ms.iter().sum::<u64>() + denoise_ms.unwrap_or(0);
        let mut turn = Turn::user(&text, confidence);
        turn.ended_at = Some(chrono::Utc::now());
        turn.corrections = corrections;
        turn.sentiment_label = Some(sentiment.label.as_str().to_string());
        turn.sentiment_score = Some(sentiment.score);
        turn.latencies = TurnLatencies {
            stt_ms: stt_ms.iter().max().copied(),
            llm_ms: None,
            tts_ms: None,
            denoise_ms,
            total_ms: Some(total_ms),
        };

        let index = {
            let mut idx = self.turn_index.lock();
            let current = *idx;
            *idx += 1;
            current
        };
        self.deps.sink.append_turn(&self.session, index, &turn).await;
        self.turns.lock().push(turn);
        self.memory.lock().push(TurnRole::User, &text);

        self.deps.dispatcher.enqueue(&EventEnvelope::new(
            WebhookEvent::TurnCompleted,
            self.session.call_id,
            self.session.org_id,
            json!({
                "role": "user",
                "text": text,
                "sentiment": sentiment.label.as_str(),
                "confidence": confidence,
            }),
        ));

        self.maybe_sentiment_alert(&sentiment);

        // Hand off to the dialogue engine
        self.turn_ctl
            .begin_assistant()
            .map_err(callweave_core::Error::from)?;
        self.start_response(&text, &flags);
        Ok(())
    }

    fn abandon_pending_turn(&mut self) {
        self.pending_text.clear();
        self.pending_words.clear();
        self.pending_corrections.clear();
        self.pending_stt_ms.clear();
        self.pending_denoise_ms = None;
        self.awaiting_commit = false;
        if matches!(
            self.turn_ctl.phase(),
            TurnPhase::UserTurn | TurnPhase::ThinkingPause
        ) {
            let _ = self.turn_ctl.abandon_turn();
        }
    }

    fn maybe_sentiment_alert(&mut self, sentiment: &FusedSentiment) {
        let rolling: f32 = if self.sentiment_window.is_empty() {
            0.0
        } else {
            let recent: Vec<f32> = self.sentiment_window.iter().rev().take(3).copied().collect();
            recent.iter().sum::<f32>() / recent.len() as f32
        };

        let should_alert = sentiment.label.is_alerting() || rolling < -0.5;
        if should_alert && self.deps.alerts.allow(self.session.call_id) {
            self.deps.dispatcher.enqueue(&EventEnvelope::new(
                WebhookEvent::SentimentAlert,
                self.session.call_id,
                self.session.org_id,
                json!({
                    "label": sentiment.label.as_str(),
                    "score": sentiment.score,
                    "rolling_score": rolling,
                }),
            ));
        }
    }

    async fn on_interruption(&mut self, energy_db: f32) -> Result<()> {
        if self.turn_ctl.phase() != TurnPhase::AssistantTurn {
            return Ok(());
        }

        self.turn_ctl
            .interrupted()
            .map_err(callweave_core::Error::from)?;

        let played_until_ms = self.playback.cancel();
        // The respond task observes the bus and stops committing; the abort
        // below reclaims it either way
        self.bus.publish(SessionSignal::Interruption {
            energy_db,
            played_until_ms,
        });
        self.tts.cancel();
        if let Some(task) = self.respond_task.take() {
            task.abort();
        }
        self.session.record_interruption();
        metrics::counter!("interruptions_total").increment(1);

        // Persist the cut-off assistant turn
        let partial = std::mem::take(&mut *self.assistant_accum.lock());
        let mut turn = Turn::assistant(partial);
        turn.ended_at = Some(chrono::Utc::now());
        turn.was_interrupted = true;
        let index = {
            let mut idx = self.turn_index.lock();
            let current = *idx;
            *idx += 1;
            current
        };
        self.deps.sink.append_turn(&self.session, index, &turn).await;
        self.memory.lock().push(TurnRole::Assistant, &turn.text);
        self.turns.lock().push(turn);

        self.deps.dispatcher.enqueue(&EventEnvelope::new(
            WebhookEvent::Interruption,
            self.session.call_id,
            self.session.org_id,
            json!({ "played_until_ms": played_until_ms, "energy_db": energy_db }),
        ));

        tracing::info!(
            call_id = %self.session.call_id,
            played_until_ms,
            "Barge-in: assistant cancelled"
        );

        self.turn_ctl
            .resume_listening()
            .map_err(callweave_core::Error::from)?;
        Ok(())
    }

    /// Speak a fixed prompt (clarification, apology) off the hot loop
    fn spawn_speak_text(&mut self, text: &str, on_done: Option<Box<dyn FnOnce() + Send>>) {
        let tts = self.tts.clone();
        let playback = self.playback.clone();
        let text = text.to_string();

        self.respond_task = Some(tokio::spawn(async move {
            if let Err(e) = speak_sentence(&tts, &playback, &text).await {
                tracing::warn!(error = %e, "Prompt synthesis failed");
            }
            playback.finish();
            if let Some(done) = on_done {
                done();
            }
        }));
    }

    /// Start the dialogue → synthesis response task for a committed turn
    fn start_response(&mut self, user_text: &str, flags: &ContextFlags) {
        self.assistant_accum.lock().clear();

        let ctx = RespondCtx {
            session: self.session.clone(),
            dialogue: self.deps.dialogue.clone(),
            tools: self.deps.tools.clone(),
            tts: self.tts.clone(),
            playback: self.playback.clone(),
            turn_ctl: self.turn_ctl.clone(),
            dispatcher: self.deps.dispatcher.clone(),
            sink: self.deps.sink.clone(),
            turns: self.turns.clone(),
            memory: self.memory.clone(),
            accum: self.assistant_accum.clone(),
            turn_index: self.turn_index.clone(),
            bus: self.bus.clone(),
        };

        let assembler = PromptAssembler::new(self.deps.context_profile.clone());
        let request = assembler.assemble(
            &self.session.call_id.to_string(),
            &self.memory.lock(),
            user_text,
            flags,
            self.deps.tools.catalog(),
        );

        self.respond_task = Some(tokio::spawn(async move {
            respond(ctx, request).await;
        }));
    }

    async fn finish(&mut self, outcome: &mut CallOutcome) {
        // Draining: the partial segment is flushed but no longer transcribed
        self.bus.publish(SessionSignal::BridgeClosed);
        let _ = self.ingress.close();
        self.playback.cancel();
        self.tts.cancel();
        if let Some(task) = self.respond_task.take() {
            task.abort();
        }
        self.turn_ctl.bridge_closed();
        self.deps.preprocess.forget_call(self.session.call_id);
        self.deps.profiles.remove(self.session.call_id);
        self.deps.alerts.forget(self.session.call_id);

        if self.captured_audio.is_empty() {
            return;
        }

        // The close-time write retries within a bounded window; if no
        // backend accepts it, the call ends in error instead of ended.
        let metadata = self.build_metadata();
        let transcript = json!({
            "turns": self.turns.lock().iter().map(|t| json!({
                "role": match t.role { TurnRole::User => "user", TurnRole::Assistant => "assistant" },
                "text": t.text,
            })).collect::<Vec<_>>(),
        });

        let deadline = Instant::now()
            + std::time::Duration::from_millis(self.deps.settings.storage.close_retry_window_ms);
        let mut stored = false;
        loop {
            match self
                .deps
                .recordings
                .store(&self.captured_audio, metadata.clone(), &transcript)
                .await
            {
                Ok(_) => {
                    stored = true;
                    break;
                }
                Err(e) if Instant::now() < deadline => {
                    tracing::warn!(error = %e, "Recording write failed, retrying");
                    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Recording write failed past the retry window");
                    break;
                }
            }
        }

        if !stored {
            *outcome = CallOutcome::Failed;
        }
    }

    /// Canonical metadata for the call's recording
    fn build_metadata(&self) -> Metadata {
        let turns = self.turns.lock();

        // The corrected transcript is the concatenation of user turn texts
        let corrected_text = turns
            .iter()
            .filter(|t| t.role == TurnRole::User)
            .map(|t| t.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");

        let corrections: Vec<(String, String)> = turns
            .iter()
            .flat_map(|t| t.corrections.iter().cloned())
            .collect();

        // Reconstruct the raw text by undoing the applied corrections
        let mut raw_text = corrected_text.clone();
        for (original, corrected) in &corrections {
            raw_text = raw_text.replacen(corrected.as_str(), original.as_str(), 1);
        }

        let user_turns: Vec<&Turn> = turns.iter().filter(|t| t.role == TurnRole::User).collect();
        let confidence = if user_turns.is_empty() {
            0.0
        } else {
            user_turns.iter().map(|t| t.stt_confidence).sum::<f32>() / user_turns.len() as f32
        };

        let last_sentiment = turns
            .iter()
            .rev()
            .find_map(|t| t.sentiment_label.clone())
            .unwrap_or_else(|| "neutral".to_string());
        let last_score = turns
            .iter()
            .rev()
            .find_map(|t| t.sentiment_score)
            .unwrap_or(0.0);

        fn avg(values: Vec<u64>) -> Option<f64> {
            if values.is_empty() {
                None
            } else {
                Some(values.iter().sum::<u64>() as f64 / values.len() as f64)
            }
        }

        Metadata {
            recording_id: callweave_core::RecordingId::new(),
            conversation_id: self.session.call_id,
            org_id: self.session.org_id,
            timestamp: self.session.started_at,
            direction: "inbound".to_string(),
            audio: callweave_storage::AudioDescriptor {
                format: String::new(),
                sample_rate: 0,
                duration_seconds: 0.0,
                file_size_bytes: 0,
                checksum_sha256: String::new(),
            },
            transcription: TranscriptionBlock {
                text: raw_text,
                corrected_text,
                language: "es".to_string(),
                confidence,
                corrections_made: corrections,
                correction_method: ProcessingMode::Online,
            },
            sentiment: SentimentBlock {
                label: last_sentiment,
                score: last_score,
                confidence,
                emotional_tone: self
                    .last_prosody
                    .as_ref()
                    .map(|p| format!("{:?}", p.emotional_tone).to_lowercase())
                    .unwrap_or_else(|| "neutral".to_string()),
            },
            intent: None,
            entities: None,
            topics: None,
            turns: turns
                .iter()
                .map(|t| TurnSummary {
                    role: match t.role {
                        TurnRole::User => "user".to_string(),
                        TurnRole::Assistant => "assistant".to_string(),
                    },
                    text: t.text.clone(),
                    started_at: t.started_at,
                    ended_at: t.ended_at,
                    stt_confidence: t.stt_confidence,
                    was_interrupted: t.was_interrupted,
                })
                .collect(),
            processing_metrics: ProcessingMetrics {
                stt_ms_avg: avg(turns.iter().filter_map(|t| t.latencies.stt_ms).collect()),
                llm_ms_avg: avg(turns.iter().filter_map(|t| t.latencies.llm_ms).collect()),
                tts_ms_avg: avg(turns.iter().filter_map(|t| t.latencies.tts_ms).collect()),
                denoise_ms_avg: avg(
                    turns.iter().filter_map(|t| t.latencies.denoise_ms).collect(),
                ),
                total_ms_avg: avg(turns.iter().filter_map(|t| t.latencies.total_ms).collect()),
            },
            processed: false,
            processing_mode: ProcessingMode::Online,
        }
    }
}

/// Synthesize one sentence and play it to completion
async fn speak_sentence(
    tts: &Arc<TtsStreamer>,
    playback: &Arc<PlaybackController>,
    text: &str,
) -> Result<()> {
    let (tx, mut rx) = mpsc::channel(64);
    let generation = tts.speak(text, None, tx).await?;
    playback.begin(generation);

    while let Some((gen, chunk)) = rx.recv().await {
        playback.push_chunk(gen, chunk).await;
    }
    Ok(())
}

/// Synthesize a sentence, applying the mid-sentence failure policy: on
/// failure, try a short apology within one second; if that also fails the
/// turn ends silently with a `turn_error` event.
///
/// Returns false when the response should stop speaking.
async fn speak_or_recover(ctx: &RespondCtx, text: &str, tts_total_ms: &mut u64) -> bool {
    let tts_start = Instant::now();
    let result = speak_sentence(&ctx.tts, &ctx.playback, text).await;
    *tts_total_ms += tts_start.elapsed().as_millis() as u64;

    let Err(e) = result else {
        return true;
    };
    tracing::warn!(error = %e, "Sentence synthesis failed");

    let apology = tokio::time::timeout(
        std::time::Duration::from_secs(1),
        speak_sentence(&ctx.tts, &ctx.playback, "Disculpa, un momento."),
    )
    .await;

    match apology {
        Ok(Ok(())) => true,
        _ => {
            ctx.sink
                .append_event(
                    &CallEvent::stage(ctx.session.call_id, ctx.session.org_id, "turn_error")
                        .with_parameters(json!({ "stage": "tts" })),
                )
                .await;
            false
        }
    }
}

/// The assistant-response flow: stream the dialogue, chunk into sentences,
/// synthesize and play each, dispatch tool calls as they arrive. An
/// interruption signal on the session bus stops the flow without
/// committing; the runner persists the partial turn instead.
async fn respond(ctx: RespondCtx, request: callweave_core::DialogueRequest) {
    let llm_start = Instant::now();
    let (event_tx, mut event_rx) = mpsc::channel::<DialogueEvent>(64);
    let mut bus_rx = ctx.bus.subscribe();

    let dialogue = ctx.dialogue.clone();
    let stream_request = request.clone();
    let stream_task = tokio::spawn(async move {
        if let Err(e) = dialogue.chat_stream(stream_request, event_tx).await {
            tracing::warn!(error = %e, "Dialogue stream failed");
        }
    });

    let detector = SentenceDetector::new(SentenceDetectorConfig::default());
    let gate = InterruptHandler::new(InterruptHandlerConfig::default());
    let mut chain_ctx = ProcessorContext::new(ctx.session.call_id);

    let mut llm_first_token_ms: Option<u64> = None;
    let mut tts_total_ms: u64 = 0;

    loop {
        let event = tokio::select! {
            biased;

            signal = bus_rx.recv() => {
                if matches!(
                    signal,
                    Ok(SessionSignal::Interruption { .. }) | Ok(SessionSignal::BridgeClosed)
                ) {
                    // Cancelled: drop the stream and commit nothing here
                    stream_task.abort();
                    return;
                }
                continue;
            }

            event = event_rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match event {
            DialogueEvent::Text { delta } => {
                if llm_first_token_ms.is_none() {
                    let elapsed = llm_start.elapsed().as_millis() as u64;
                    metrics::histogram!("llm_first_token_ms").record(elapsed as f64);
                    llm_first_token_ms = Some(elapsed);
                }
                ctx.accum.lock().push_str(&delta);

                let frames = match detector
                    .process(
                        Frame::LlmChunk {
                            text: delta,
                            is_final: false,
                        },
                        &mut chain_ctx,
                    )
                    .await
                {
                    Ok(frames) => frames,
                    Err(e) => {
                        tracing::warn!(error = %e, "Sentence detection failed");
                        continue;
                    }
                };

                for frame in frames {
                    if let Ok(passed) = gate.process(frame, &mut chain_ctx).await {
                        for frame in passed {
                            if let Frame::Sentence { text, .. } = frame {
                                if !speak_or_recover(&ctx, &text, &mut tts_total_ms).await {
                                    stream_task.abort();
                                    return;
                                }
                            }
                        }
                    }
                }
            }

            DialogueEvent::ToolCall { name, arguments } => {
                dispatch_tool(&ctx, &name, arguments).await;
            }

            DialogueEvent::Done { .. } => break,
        }
    }

    let _ = stream_task.await;

    // Flush the tail of the stream through the detector
    if let Ok(frames) = detector
        .process(Frame::Control(ControlFrame::Flush), &mut chain_ctx)
        .await
    {
        for frame in frames {
            if let Ok(passed) = gate.process(frame, &mut chain_ctx).await {
                for frame in passed {
                    if let Frame::Sentence { text, .. } = frame {
                        if !speak_or_recover(&ctx, &text, &mut tts_total_ms).await {
                            return;
                        }
                    }
                }
            }
        }
    }

    ctx.playback.finish();

    // Commit the assistant turn
    let text = std::mem::take(&mut *ctx.accum.lock());
    let mut turn = Turn::assistant(&text);
    turn.ended_at = Some(chrono::Utc::now());
    turn.latencies = TurnLatencies {
        stt_ms: None,
        llm_ms: Some(llm_start.elapsed().as_millis() as u64),
        tts_ms: Some(tts_total_ms),
        denoise_ms: None,
        total_ms: Some(llm_start.elapsed().as_millis() as u64),
    };

    let index = {
        let mut idx = ctx.turn_index.lock();
        let current = *idx;
        *idx += 1;
        current
    };
    ctx.sink.append_turn(&ctx.session, index, &turn).await;
    ctx.memory.lock().push(TurnRole::Assistant, &text);
    ctx.turns.lock().push(turn);

    ctx.dispatcher.enqueue(&EventEnvelope::new(
        WebhookEvent::TurnCompleted,
        ctx.session.call_id,
        ctx.session.org_id,
        json!({ "role": "assistant", "text": text }),
    ));

    if let Err(e) = ctx.turn_ctl.assistant_finished() {
        tracing::debug!(error = %e, "Assistant finish transition skipped");
    }
}

/// Execute one tool call and feed its result back to the engine.
///
/// The execution task is detached so a cancelled assistant turn lets the
/// call finish; only its textual response is discarded. Compensation of
/// external side effects stays with the tool handler.
async fn dispatch_tool(ctx: &RespondCtx, name: &str, arguments: serde_json::Value) {
    let invocation = match ToolInvocation::parse(name, arguments) {
        Ok(invocation) => invocation,
        Err(e) => {
            tracing::warn!(tool = name, error = %e, "Rejected tool invocation");
            let _ = ctx
                .dialogue
                .submit_tool_result(
                    &ctx.session.call_id.to_string(),
                    name,
                    json!({ "error": e.to_string() }),
                )
                .await;
            return;
        }
    };

    match invocation.kind {
        ToolKind::TransferToAgent => {
            ctx.dispatcher.enqueue(&EventEnvelope::new(
                WebhookEvent::TransferRequested,
                ctx.session.call_id,
                ctx.session.org_id,
                invocation.raw.clone(),
            ));
        }
        ToolKind::ScheduleCallback => {
            ctx.dispatcher.enqueue(&EventEnvelope::new(
                WebhookEvent::CallbackScheduled,
                ctx.session.call_id,
                ctx.session.org_id,
                invocation.raw.clone(),
            ));
        }
        _ => {}
    }

    let tools = ctx.tools.clone();
    let dialogue = ctx.dialogue.clone();
    let sink = ctx.sink.clone();
    let session = ctx.session.clone();
    let tool_name = invocation.kind.name();

    let handle = tokio::spawn(async move {
        let start = Instant::now();
        let result = tools.execute(&invocation).await;

        let (value, latency_ms) = match result {
            Ok(output) => (output.result, output.duration_ms),
            Err(e) => (
                json!({ "error": e.to_string() }),
                start.elapsed().as_millis() as u64,
            ),
        };

        sink.append_event(
            &CallEvent::stage(session.call_id, session.org_id, "tool")
                .with_latency(latency_ms)
                .with_parameters(json!({ "tool": tool_name })),
        )
        .await;

        if let Err(e) = dialogue
            .submit_tool_result(&session.call_id.to_string(), tool_name, value)
            .await
        {
            tracing::warn!(error = %e, "Tool result submission failed");
        }
    });

    // Await inline; if the respond task is aborted the spawned tool task
    // still runs to completion on its own.
    let _ = handle.await;
}
