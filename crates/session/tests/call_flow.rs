//! End-to-end call flow against fake model services
//!
//! Drives the runner with synthetic bridge frames and scripted STT/TTS/
//! dialogue backends: the online-correction happy path, critical-word
//! clarification, and barge-in cancellation.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};

use callweave_config::Settings;
use callweave_core::{
    AgentId, AudioFrame, CallEvent, CallId, DialogueEvent, DialogueRequest, DialogueStream, OrgId,
    Result, SampleRate, SpeechToText, TextToSpeech, TranscriptionResult, Turn, TurnRole, TtsChunk,
    WebhookEvent, WordConfidence,
};
use callweave_pipeline::{PreprocessorGateway, SttAdapter, VoiceProfileStore};
use callweave_pipeline::preprocess::PreprocessTimeouts;
use callweave_pipeline::stt::SttConfig;
use callweave_session::{CallRunner, RunnerDeps, RunnerInput, Session, TurnSink};
use callweave_storage::RecordingStore;
use callweave_text_processing::{
    Clarifier, CorrectionDictionary, CriticalCategories, OnlineCorrector, SentimentFuser,
};
use callweave_tools::ToolRegistry;
use callweave_webhooks::{Dispatcher, DispatcherConfig, SentimentAlertLimiter, Subscription, WebhookTransport};

/// Scripted STT: pops one result per request
struct ScriptedStt {
    results: Mutex<Vec<TranscriptionResult>>,
}

#[async_trait]
impl SpeechToText for ScriptedStt {
    async fn transcribe(&self, _samples: &[f32], _params: &Value) -> Result<TranscriptionResult> {
        let mut results = self.results.lock();
        if results.is_empty() {
            Ok(TranscriptionResult::default())
        } else {
            Ok(results.remove(0))
        }
    }

    async fn learn_correction(&self, _original: &str, _corrected: &str) -> Result<()> {
        Ok(())
    }
}

/// Records every synthesized text; emits audio chunks with a per-chunk delay
struct RecordingTts {
    spoken: Arc<Mutex<Vec<String>>>,
    chunks_per_text: usize,
    chunk_delay: Duration,
}

#[async_trait]
impl TextToSpeech for RecordingTts {
    async fn synthesize(
        &self,
        text: &str,
        _voice: Option<&str>,
        tx: mpsc::Sender<TtsChunk>,
    ) -> Result<()> {
        self.spoken.lock().push(text.to_string());
        for seq in 0..self.chunks_per_text {
            tokio::time::sleep(self.chunk_delay).await;
            let chunk = TtsChunk {
                audio: AudioFrame::new(vec![0.1; 320], SampleRate::Hz16000, seq as u64),
                seq: seq as u64,
                is_final: seq + 1 == self.chunks_per_text,
            };
            if tx.send(chunk).await.is_err() {
                return Ok(());
            }
        }
        Ok(())
    }
}

/// Streams scripted text deltas; records whether it was called
struct ScriptedDialogue {
    deltas: Vec<String>,
    delta_delay: Duration,
    calls: Arc<Mutex<Vec<DialogueRequest>>>,
}

#[async_trait]
impl DialogueStream for ScriptedDialogue {
    async fn chat_stream(
        &self,
        request: DialogueRequest,
        tx: mpsc::Sender<DialogueEvent>,
    ) -> Result<()> {
        self.calls.lock().push(request);
        for delta in &self.deltas {
            tokio::time::sleep(self.delta_delay).await;
            if tx
                .send(DialogueEvent::Text {
                    delta: delta.clone(),
                })
                .await
                .is_err()
            {
                return Ok(());
            }
        }
        let _ = tx.send(DialogueEvent::Done { usage: None }).await;
        Ok(())
    }

    async fn submit_tool_result(&self, _conversation: &str, _name: &str, _result: Value) -> Result<()> {
        Ok(())
    }
}

/// Captures webhook envelopes instead of delivering them
struct CapturingTransport {
    envelopes: Arc<Mutex<Vec<Value>>>,
}

#[async_trait]
impl WebhookTransport for CapturingTransport {
    async fn deliver(&self, _url: &str, body: &[u8], _signature: &str) -> std::result::Result<u16, String> {
        let value: Value = serde_json::from_slice(body).map_err(|e| e.to_string())?;
        self.envelopes.lock().push(value);
        Ok(200)
    }
}

/// Captures persisted turns and events
#[derive(Default)]
struct MemorySink {
    turns: Mutex<Vec<Turn>>,
    events: Mutex<Vec<CallEvent>>,
}

#[async_trait]
impl TurnSink for MemorySink {
    async fn append_turn(&self, _session: &Session, _index: i32, turn: &Turn) {
        self.turns.lock().push(turn.clone());
    }

    async fn append_event(&self, event: &CallEvent) {
        self.events.lock().push(event.clone());
    }
}

struct Harness {
    deps: RunnerDeps,
    session: Arc<Session>,
    sink: Arc<MemorySink>,
    spoken: Arc<Mutex<Vec<String>>>,
    dialogue_calls: Arc<Mutex<Vec<DialogueRequest>>>,
    envelopes: Arc<Mutex<Vec<Value>>>,
    _recordings_dir: tempfile::TempDir,
}

fn words(list: &[(&str, f32)]) -> Vec<WordConfidence> {
    list.iter()
        .map(|(w, c)| WordConfidence {
            word: w.to_string(),
            confidence: *c,
            start: 0.0,
            end: 0.0,
        })
        .collect()
}

fn harness(
    stt_results: Vec<TranscriptionResult>,
    dialogue_deltas: Vec<String>,
    tts_chunks: usize,
    tts_chunk_delay: Duration,
) -> Harness {
    let spoken = Arc::new(Mutex::new(Vec::new()));
    let dialogue_calls = Arc::new(Mutex::new(Vec::new()));
    let envelopes = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::new(MemorySink::default());
    let recordings_dir = tempfile::tempdir().unwrap();

    let dispatcher = Arc::new(Dispatcher::new(
        DispatcherConfig {
            backoff_base_secs: 0,
            ..Default::default()
        },
        Arc::new(CapturingTransport {
            envelopes: envelopes.clone(),
        }),
        None,
    ));
    // One subscription listening to everything so envelopes get captured
    dispatcher.upsert_subscription(Subscription {
        id: callweave_core::WebhookId::new(),
        org_id: OrgId::new(),
        url: "http://receiver.example/hook".into(),
        events: [
            WebhookEvent::CallStarted,
            WebhookEvent::CallEnded,
            WebhookEvent::TurnCompleted,
            WebhookEvent::Interruption,
            WebhookEvent::TransferRequested,
            WebhookEvent::CallbackScheduled,
            WebhookEvent::SentimentAlert,
            WebhookEvent::Error,
        ]
        .into_iter()
        .collect(),
        secret: "shh".into(),
        description: None,
        active: true,
    });

    let profiles = Arc::new(VoiceProfileStore::new());

    let deps = RunnerDeps {
        settings: Settings::default(),
        stt: Arc::new(SttAdapter::new(
            Arc::new(ScriptedStt {
                results: Mutex::new(stt_results),
            }),
            32,
            SttConfig::default(),
        )),
        tts_service: Arc::new(RecordingTts {
            spoken: spoken.clone(),
            chunks_per_text: tts_chunks,
            chunk_delay: tts_chunk_delay,
        }),
        tts_cap: Arc::new(Semaphore::new(32)),
        dialogue: Arc::new(ScriptedDialogue {
            deltas: dialogue_deltas,
            delta_delay: Duration::from_millis(5),
            calls: dialogue_calls.clone(),
        }),
        preprocess: Arc::new(PreprocessorGateway::new(
            None,
            None,
            None,
            PreprocessTimeouts::default(),
            profiles.clone(),
            3000,
        )),
        profiles,
        corrector: Arc::new(OnlineCorrector::new(
            Arc::new(CorrectionDictionary::seeded()),
            20,
        )),
        clarifier: Arc::new(Clarifier::new(CriticalCategories::default(), 0.6, 3)),
        fuser: Arc::new(SentimentFuser::default()),
        tools: Arc::new(ToolRegistry::new()),
        recordings: Arc::new(RecordingStore::new(recordings_dir.path(), None)),
        sink: sink.clone(),
        dispatcher,
        alerts: Arc::new(SentimentAlertLimiter::new(Duration::from_secs(30))),
        context_profile: "Eres un asistente de atención al cliente.".to_string(),
    };

    let session = Arc::new(Session::new(
        CallId::new(),
        OrgId::new(),
        AgentId::new(),
        "+34600111222".to_string(),
    ));

    Harness {
        deps,
        session,
        sink,
        spoken,
        dialogue_calls,
        envelopes,
        _recordings_dir: recordings_dir,
    }
}

fn speech_frame(seq: u64) -> RunnerInput {
    RunnerInput::Audio(AudioFrame::new(vec![0.3; 320], SampleRate::Hz16000, seq))
}

fn silence_frame(seq: u64) -> RunnerInput {
    RunnerInput::Audio(AudioFrame::new(vec![0.0; 320], SampleRate::Hz16000, seq))
}

/// Feed one spoken utterance: `speech_frames` of voice then enough silence
/// to cross the end-of-turn pause (1500 ms = 75 frames)
async fn feed_utterance(tx: &mpsc::Sender<RunnerInput>, speech_frames: u64) {
    for seq in 0..speech_frames {
        tx.send(speech_frame(seq)).await.unwrap();
    }
    for seq in speech_frames..(speech_frames + 80) {
        tx.send(silence_frame(seq)).await.unwrap();
    }
}

#[tokio::test]
async fn test_online_correction_happy_path() {
    let transcription = TranscriptionResult {
        text: "Necesito revisar el salgo de mi cuesta".to_string(),
        language: "es".to_string(),
        confidence: 0.91,
        words: words(&[
            ("Necesito", 0.95),
            ("revisar", 0.93),
            ("el", 0.99),
            ("salgo", 0.7),
            ("de", 0.99),
            ("mi", 0.98),
            ("cuesta", 0.65),
        ]),
        ..Default::default()
    };

    let h = harness(
        vec![transcription],
        vec!["Claro, su saldo es de cien euros.".to_string()],
        2,
        Duration::from_millis(1),
    );
    let (egress_tx, mut egress) = mpsc::channel::<AudioFrame>(1024);
    tokio::spawn(async move { while egress.recv().await.is_some() {} });

    let runner = CallRunner::new(h.session.clone(), h.deps.clone(), egress_tx);
    let (tx, rx) = mpsc::channel(2048);
    let run = tokio::spawn(runner.run(rx));

    feed_utterance(&tx, 50).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    drop(tx);
    tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .unwrap()
        .unwrap();

    // The committed user turn carries the corrected text
    let turns = h.sink.turns.lock();
    let user_turn = turns
        .iter()
        .find(|t| t.role == TurnRole::User)
        .expect("user turn committed");
    assert_eq!(user_turn.text, "Necesito revisar el saldo de mi cuenta");
    assert_eq!(
        user_turn.corrections,
        vec![
            ("salgo".to_string(), "saldo".to_string()),
            ("cuesta".to_string(), "cuenta".to_string()),
        ]
    );

    // The dialogue engine saw the corrected utterance
    let calls = h.dialogue_calls.lock();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].user, "Necesito revisar el saldo de mi cuenta");

    // And the assistant reply was synthesized
    assert!(h
        .spoken
        .lock()
        .iter()
        .any(|s| s.contains("saldo es de cien euros")));
}

#[tokio::test]
async fn test_critical_word_clarification_blocks_commit() {
    let transcription = TranscriptionResult {
        text: "Quiero cancelar mi cuenta".to_string(),
        language: "es".to_string(),
        confidence: 0.81,
        words: words(&[
            ("Quiero", 0.95),
            ("cancelar", 0.40),
            ("mi", 0.97),
            ("cuenta", 0.92),
        ]),
        ..Default::default()
    };

    let h = harness(
        vec![transcription],
        vec!["No debería llegar aquí.".to_string()],
        1,
        Duration::from_millis(1),
    );
    let (egress_tx, mut egress) = mpsc::channel::<AudioFrame>(1024);
    tokio::spawn(async move { while egress.recv().await.is_some() {} });

    let runner = CallRunner::new(h.session.clone(), h.deps.clone(), egress_tx);
    let (tx, rx) = mpsc::channel(2048);
    let run = tokio::spawn(runner.run(rx));

    feed_utterance(&tx, 50).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    drop(tx);
    tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .unwrap()
        .unwrap();

    // No user turn was committed and the dialogue engine was never called
    assert!(h.sink.turns.lock().iter().all(|t| t.role != TurnRole::User));
    assert!(h.dialogue_calls.lock().is_empty());

    // The clarification prompt was synthesized verbatim
    assert!(h
        .spoken
        .lock()
        .iter()
        .any(|s| s == "¿Dijiste 'cancelar'? Quiero confirmar antes de proceder."));

    // And one clarification was counted against the per-call budget
    assert_eq!(h.session.clarifications(), 1);
}

#[tokio::test]
async fn test_barge_in_cancels_assistant() {
    let transcription = TranscriptionResult {
        text: "Hola buenos días necesito ayuda".to_string(),
        language: "es".to_string(),
        confidence: 0.9,
        words: words(&[
            ("Hola", 0.95),
            ("buenos", 0.95),
            ("días", 0.95),
            ("necesito", 0.95),
            ("ayuda", 0.95),
        ]),
        ..Default::default()
    };

    // A long reply synthesized slowly so the user can interrupt it
    let h = harness(
        vec![transcription],
        vec!["Por supuesto, le explico todos los detalles de nuestras opciones disponibles.".to_string()],
        200,
        Duration::from_millis(10),
    );
    let (egress_tx, mut egress) = mpsc::channel::<AudioFrame>(1024);
    tokio::spawn(async move { while egress.recv().await.is_some() {} });

    let runner = CallRunner::new(h.session.clone(), h.deps.clone(), egress_tx);
    let (tx, rx) = mpsc::channel(4096);
    let run = tokio::spawn(runner.run(rx));

    feed_utterance(&tx, 50).await;

    // Give the reply time to start playing
    tokio::time::sleep(Duration::from_millis(400)).await;

    // The user barges in: sustained speech over the 150 ms threshold
    for seq in 1000..1030 {
        tx.send(speech_frame(seq)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    drop(tx);
    tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .unwrap()
        .unwrap();

    // The assistant turn was stored as interrupted
    let turns = h.sink.turns.lock();
    assert!(
        turns
            .iter()
            .any(|t| t.role == TurnRole::Assistant && t.was_interrupted),
        "interrupted assistant turn should be persisted"
    );
    assert_eq!(h.session.interruptions(), 1);

    // An interruption webhook fired with the playback position
    tokio::time::sleep(Duration::from_millis(100)).await;
    let envelopes = h.envelopes.lock();
    let interruption = envelopes
        .iter()
        .find(|e| e["event_type"] == "interruption")
        .expect("interruption webhook fired");
    assert!(interruption["data"]["played_until_ms"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn test_segment_below_min_speech_not_transcribed() {
    let h = harness(vec![], vec![], 1, Duration::from_millis(1));
    let (egress_tx, mut egress) = mpsc::channel::<AudioFrame>(1024);
    tokio::spawn(async move { while egress.recv().await.is_some() {} });

    let runner = CallRunner::new(h.session.clone(), h.deps.clone(), egress_tx);
    let (tx, rx) = mpsc::channel(2048);
    let run = tokio::spawn(runner.run(rx));

    // 200 ms of speech: below the 250 ms minimum
    feed_utterance(&tx, 10).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    drop(tx);
    tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .unwrap()
        .unwrap();

    assert!(h.sink.turns.lock().is_empty());
    assert!(h.dialogue_calls.lock().is_empty());
}
