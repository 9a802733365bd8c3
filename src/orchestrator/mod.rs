//! CallOrchestrator (C12, §4.10)
//!
//! Top-level per-process coordinator. Exposes `initiate`, `on_webhook`
//! dispatch, and `end`; owns every call's [`DialogSession`] and the guard
//! flags that keep a call's inference pipeline from running twice at
//! once. The two media paths — carrier-side recording, and the optional
//! realtime `/media-stream` WebSocket — share this module's pipeline
//! stages through the [`media_stream::UtteranceSink`] trait, so neither
//! path depends on the other's module.

pub mod media_stream;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::audio_store::{AudioKind, AudioStore, AudioStoreStats};
use crate::carrier::CarrierClient;
use crate::config::Config;
use crate::dialog::classifier::{Classifier, GenerationRequest};
use crate::dialog::hallucination_guard;
use crate::dialog::response_selector::{self, ReplyMethod};
use crate::dialog::script_table::ScriptTable;
use crate::dialog::silence_policy::{self, SilenceHistory};
use crate::dialog::state_machine;
use crate::dialog::DialogSession;
use crate::error::CoreError;
use crate::markup::MarkupResponse;
use crate::metrics::CountersSnapshot;
use crate::persistence::{CallStore, ClientStore};
use crate::phrase_cache::PhraseCache;
use crate::queue::{BoxFuture, EnqueueOptions, Handler, JobQueue, Priority};
use crate::types::{
    Call, CallId, CallResult, CallStatus, ConversationTurn, Intent, Recording, RecordingEvent, RecordingEventKind,
    Speaker, Stage, TerminalReason,
};
use crate::voice::stt::{SttEngine, TranscriptionResult};
use crate::voice::tts::{SynthesizeRequest, TtsEngine, TtsResult};

/// Default teardown grace (§5): how long `end()` waits after a terminal
/// status update for any in-flight recording processing to clear.
const TEARDOWN_GRACE: Duration = Duration::from_secs(45);
/// Extra grace granted exactly once if `processing_recording` is still
/// set when the first deadline expires.
const TEARDOWN_EXTENSION: Duration = Duration::from_secs(20);
/// Overall cap on one recording-processing pipeline run (§4.10).
const RECORDING_PIPELINE_TIMEOUT: Duration = Duration::from_secs(120);
const RECORDING_PIPELINE_MAX_ATTEMPTS: u32 = 3;
/// Soft timeout on response generation before falling back to the
/// scripted reply (§5 Cancellation & timeouts).
const RESPONSE_SOFT_TIMEOUT: Duration = Duration::from_secs(15);

/// Audio queued for the carrier to play on its next markup poll, handed
/// off and consumed exactly once (§3 PendingAudio ownership).
#[derive(Debug, Clone)]
pub enum PendingAudio {
    Cache { url: String },
    Primary { url: String },
    Fallback { text: String, fallback_voice_id: String },
}

/// Per-call re-entrancy guards (§5 Per-call serialization).
#[derive(Default)]
struct CallGuards {
    is_processing: AtomicBool,
    processing_recording: AtomicBool,
}

pub struct InitiateOutcome {
    pub call_id: CallId,
    pub carrier_sid: String,
    pub client_name: String,
    pub phone: String,
    pub status: CallStatus,
}

/// `/health` liveness/readiness snapshot (§6.1): queue depths, worker-pool
/// occupancy proxies, and active-call count.
#[derive(Debug, serde::Serialize)]
pub struct HealthSnapshot {
    pub active_calls: usize,
    pub stt_queue_depth: usize,
    pub llm_queue_depth: usize,
    pub generate_queue_depth: usize,
    pub tts_queue_depth: usize,
    pub tts_counters: CountersSnapshot,
    pub audio_store: AudioStoreStats,
}

pub struct CallOrchestrator {
    config: Arc<Config>,
    call_store: Arc<dyn CallStore>,
    client_store: Arc<dyn ClientStore>,
    carrier: Arc<CarrierClient>,
    audio_store: Arc<AudioStore>,
    phrase_cache: Arc<PhraseCache>,
    tts: Arc<TtsEngine>,
    /// Operator-tunable wording/transitions (§4.6), consulted before the
    /// built-in [`state_machine::next`] rules on every turn.
    script_table: Arc<ScriptTable>,
    /// Bounds concurrent in-flight STT vendor calls across every call in
    /// the process (§4.9 C8).
    stt_queue: JobQueue<Vec<u8>, TranscriptionResult>,
    /// Bounds concurrent in-flight classify-vendor calls; a job that
    /// exhausts its retries falls back to [`classifier::classify_by_keywords`]
    /// at the call site rather than inside the queue.
    llm_queue: JobQueue<String, Intent>,
    /// Bounds concurrent in-flight "generated"-reply LLM calls (§4.6 C6),
    /// kept separate from `llm_queue` since it's a different vendor
    /// request/response shape (free text, not a classification label).
    generate_queue: JobQueue<GenerationRequest, String>,
    /// Bounds concurrent in-flight TTS vendor calls.
    tts_queue: JobQueue<SynthesizeRequest, TtsResult>,
    sessions: DashMap<CallId, Arc<AsyncMutex<DialogSession>>>,
    guards: DashMap<CallId, Arc<CallGuards>>,
    pending_audio: DashMap<CallId, AsyncMutex<Option<PendingAudio>>>,
    /// Outbound channel to a call's live `/media-stream` WebSocket, present
    /// only while that connection is open (§4.11); absent for calls using
    /// only the carrier-recording path.
    media_replies: DashMap<CallId, mpsc::UnboundedSender<Vec<u8>>>,
}

impl CallOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        call_store: Arc<dyn CallStore>,
        client_store: Arc<dyn ClientStore>,
        carrier: Arc<CarrierClient>,
        audio_store: Arc<AudioStore>,
        phrase_cache: Arc<PhraseCache>,
        tts: Arc<TtsEngine>,
        stt: Arc<SttEngine>,
        classifier: Arc<Classifier>,
        script_table: Arc<ScriptTable>,
    ) -> Arc<Self> {
        let stt_handler: Handler<Vec<u8>, TranscriptionResult> = {
            let stt = stt.clone();
            Arc::new(move |blob: Vec<u8>| -> BoxFuture<Result<TranscriptionResult, String>> {
                let stt = stt.clone();
                Box::pin(async move { stt.transcribe(blob).await.map_err(|e| e.to_string()) })
            })
        };
        let stt_queue = JobQueue::new(config.queues.stt_concurrency, config.queues.default_max_attempts, stt_handler);

        let llm_handler: Handler<String, Intent> = {
            let classifier = classifier.clone();
            Arc::new(move |text: String| -> BoxFuture<Result<Intent, String>> {
                let classifier = classifier.clone();
                Box::pin(async move { classifier.classify_via_llm(&text).await })
            })
        };
        let llm_queue = JobQueue::new(config.queues.llm_concurrency, config.queues.default_max_attempts, llm_handler);

        let generate_handler: Handler<GenerationRequest, String> = {
            let classifier = classifier.clone();
            Arc::new(move |request: GenerationRequest| -> BoxFuture<Result<String, String>> {
                let classifier = classifier.clone();
                Box::pin(async move { classifier.generate_reply(request).await })
            })
        };
        let generate_queue = JobQueue::new(config.queues.generate_concurrency, config.queues.default_max_attempts, generate_handler);

        let tts_handler: Handler<SynthesizeRequest, TtsResult> = {
            let tts = tts.clone();
            Arc::new(move |req: SynthesizeRequest| -> BoxFuture<Result<TtsResult, String>> {
                let tts = tts.clone();
                Box::pin(async move { tts.synthesize(req).await.map_err(|e| e.to_string()) })
            })
        };
        let tts_queue = JobQueue::new(config.queues.tts_concurrency, config.queues.default_max_attempts, tts_handler);

        Arc::new(Self {
            config,
            call_store,
            client_store,
            carrier,
            audio_store,
            phrase_cache,
            tts,
            script_table,
            stt_queue,
            llm_queue,
            generate_queue,
            tts_queue,
            sessions: DashMap::new(),
            guards: DashMap::new(),
            pending_audio: DashMap::new(),
            media_replies: DashMap::new(),
        })
    }

    fn guards_for(&self, call_id: CallId) -> Arc<CallGuards> {
        self.guards.entry(call_id).or_insert_with(|| Arc::new(CallGuards::default())).clone()
    }

    /// Snapshot of every call this process currently tracks a session for,
    /// used by the server's shutdown sequence to end each one with
    /// `reason=server_shutdown` (§5).
    pub fn active_call_ids(&self) -> Vec<CallId> {
        self.sessions.iter().map(|entry| *entry.key()).collect()
    }

    /// `/health` snapshot (§6.1): queue waiting-depths double as the
    /// worker-pool occupancy proxy the spec asks for, since every queue
    /// reports backpressure once its waiting heap grows past `warn_depth`.
    pub fn health_snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            active_calls: self.sessions.len(),
            stt_queue_depth: self.stt_queue.waiting_depth(),
            llm_queue_depth: self.llm_queue.waiting_depth(),
            generate_queue_depth: self.generate_queue.waiting_depth(),
            tts_queue_depth: self.tts_queue.waiting_depth(),
            tts_counters: self.tts.counters().snapshot(),
            audio_store: self.audio_store.stats(),
        }
    }

    /// `initiate(client-id) -> {call-id, carrier-sid}` (§4.10).
    pub async fn initiate(&self, client_id: &str) -> Result<InitiateOutcome, CoreError> {
        if client_id.trim().is_empty() {
            return Err(CoreError::InvalidClientId(client_id.to_string()));
        }
        let client = self
            .client_store
            .get(client_id)
            .await
            .map_err(|_| CoreError::ClientNotFound(client_id.to_string()))?;

        let call_id = CallId::new_v4();
        self.call_store
            .create(Call::new(call_id, client_id.to_string()))
            .await
            .map_err(|e| CoreError::Carrier(e.to_string()))?;
        self.sessions.insert(call_id, Arc::new(AsyncMutex::new(DialogSession::new())));
        self.guards.insert(call_id, Arc::new(CallGuards::default()));
        self.pending_audio.insert(call_id, AsyncMutex::new(None));

        let greeting_template = state_machine::next(Stage::Start, Intent::Positive, 0).reply_template;
        let greeting_text = response_selector::personalize(
            &greeting_template,
            &client.name,
            &client.company,
            client.debt_amount,
            &client.contract_ref,
            client.partial_payment_offer,
        );
        let greeting = self.synthesize_and_stage(call_id, &greeting_text, true).await;
        *self.pending_audio.get(&call_id).unwrap().lock().await = Some(greeting);

        let greeting_turn = ConversationTurn {
            timestamp: Utc::now(),
            speaker: Speaker::Agent,
            text: greeting_text,
            intent: None,
        };
        if let Some(session_arc) = self.sessions.get(&call_id).map(|r| r.clone()) {
            session_arc.lock().await.append_turn(greeting_turn.clone());
        }
        let _ = self.call_store.append_turn(call_id, greeting_turn).await;

        let base = self.config.server.server_url.trim_end_matches('/');
        let twiml_url = format!("{base}/webhooks/twiml/{call_id}");
        let status_url = format!("{base}/webhooks/status/{call_id}");

        let carrier_sid = match self.carrier.place_call(&client.phone, &twiml_url, &status_url).await {
            Ok(sid) => sid,
            Err(e) => {
                warn!(call_id = %call_id, error = %e, "carrier failed to place call");
                return Err(e);
            }
        };
        let _ = self.call_store.set_call_sid(call_id, carrier_sid.clone()).await;

        Ok(InitiateOutcome {
            call_id,
            carrier_sid,
            client_name: client.name,
            phone: client.phone,
            status: CallStatus::Initiated,
        })
    }

    /// Synthesize `text` (high-priority greeting or a normal turn reply)
    /// and convert the [`TtsResult`] into the [`PendingAudio`] shape the
    /// markup responder consumes.
    async fn synthesize_and_stage(&self, call_id: CallId, text: &str, priority: bool) -> PendingAudio {
        let mut request = SynthesizeRequest::new(text.to_string());
        request.priority = priority;
        let queue_priority = if priority { Priority::Urgent } else { Priority::Normal };
        let options = EnqueueOptions { priority: queue_priority, ..Default::default() };
        match self.tts_queue.enqueue(call_id, request, options).wait().await {
            Ok(result) => self.stage_tts_result(call_id, text, result),
            Err(e) => {
                warn!(call_id = %call_id, error = %e, "tts synthesis failed outright");
                PendingAudio::Fallback {
                    text: text.to_string(),
                    fallback_voice_id: self.config.tts.fallback_voice_id.clone(),
                }
            }
        }
    }

    /// Convert a [`TtsResult`] into the [`PendingAudio`] shape the markup
    /// responder consumes, persisting freshly-synthesized audio to the
    /// store. `fallback_text` is what gets said if persisting fails.
    fn stage_tts_result(&self, call_id: CallId, fallback_text: &str, result: TtsResult) -> PendingAudio {
        match result {
            TtsResult::Cache { url } => PendingAudio::Cache { url },
            TtsResult::Primary { blob, voice: _ } => match self.audio_store.put(call_id, &blob, AudioKind::Response) {
                Ok((url, _id)) => PendingAudio::Primary { url },
                Err(e) => {
                    warn!(call_id = %call_id, error = %e, "failed to persist synthesized audio");
                    PendingAudio::Fallback {
                        text: fallback_text.to_string(),
                        fallback_voice_id: self.config.tts.fallback_voice_id.clone(),
                    }
                }
            },
            TtsResult::Fallback { text, fallback_voice_id } => PendingAudio::Fallback { text, fallback_voice_id },
        }
    }

    /// **markup-request** handling (§4.10).
    pub async fn handle_markup_request(&self, call_id: CallId) -> MarkupResponse {
        let Some(entry) = self.pending_audio.get(&call_id) else {
            return MarkupResponse::error("Внутренняя ошибка, попробуйте позже.", &self.config.tts.fallback_voice_id, &self.config.tts.language);
        };
        let mut slot = entry.lock().await;
        let base = self.config.server.server_url.trim_end_matches('/');
        let record_action = format!("{base}/webhooks/recording/{call_id}");
        let record_status = format!("{base}/webhooks/recording-status/{call_id}");

        match slot.take() {
            Some(PendingAudio::Cache { url }) | Some(PendingAudio::Primary { url }) => {
                MarkupResponse::new().play(url).record(record_action, record_status)
            }
            Some(PendingAudio::Fallback { text, fallback_voice_id }) => MarkupResponse::new()
                .say(text, fallback_voice_id, self.config.tts.language.clone())
                .record(record_action, record_status),
            None => {
                let twiml_url = format!("{base}/webhooks/twiml/{call_id}");
                MarkupResponse::wait_and_redirect(twiml_url)
            }
        }
    }

    /// **status-update** handling (§4.10).
    pub async fn handle_status_update(self: &Arc<Self>, call_id: CallId, carrier_status: &str) {
        let Some(status) = CallStatus::from_carrier_str(carrier_status) else {
            warn!(call_id = %call_id, carrier_status, "unrecognized carrier status, ignoring");
            return;
        };
        if self.call_store.set_status(call_id, status).await.is_err() {
            warn!(call_id = %call_id, "status update for unknown call");
            return;
        }
        if !status.is_terminal() {
            return;
        }

        let orchestrator = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(TEARDOWN_GRACE).await;
            let guards = orchestrator.guards_for(call_id);
            if guards.processing_recording.load(Ordering::SeqCst) {
                debug!(call_id = %call_id, "recording still processing at teardown deadline, extending once");
                tokio::time::sleep(TEARDOWN_EXTENSION).await;
            }
            orchestrator.end(call_id, TerminalReason::from_status(status)).await;
        });
    }

    /// **recording-available** handling (§4.10): acknowledge the carrier
    /// immediately, then process the recording in the background.
    pub async fn handle_recording_available(
        self: &Arc<Self>,
        call_id: CallId,
        recording_url: String,
        digits: Option<String>,
    ) -> MarkupResponse {
        let guards = self.guards_for(call_id);
        if guards.is_processing.swap(true, Ordering::SeqCst) {
            debug!(call_id = %call_id, "pipeline already processing, dropping duplicate recording event");
        } else {
            let orchestrator = self.clone();
            tokio::spawn(async move {
                orchestrator.process_recording(call_id, recording_url, digits).await;
            });
        }

        let base = self.config.server.server_url.trim_end_matches('/');
        MarkupResponse::wait_and_redirect(format!("{base}/webhooks/twiml/{call_id}"))
    }

    async fn process_recording(self: Arc<Self>, call_id: CallId, recording_url: String, _digits: Option<String>) {
        let guards = self.guards_for(call_id);
        guards.processing_recording.store(true, Ordering::SeqCst);

        let result = tokio::time::timeout(RECORDING_PIPELINE_TIMEOUT, self.run_recording_pipeline(call_id, &recording_url)).await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(call_id = %call_id, error = %e, "recording pipeline failed"),
            Err(_) => warn!(call_id = %call_id, "recording pipeline exceeded overall timeout"),
        }

        guards.processing_recording.store(false, Ordering::SeqCst);
        guards.is_processing.store(false, Ordering::SeqCst);
    }

    async fn run_recording_pipeline(&self, call_id: CallId, recording_url: &str) -> Result<(), CoreError> {
        let mut last_err = None;
        for attempt in 0..RECORDING_PIPELINE_MAX_ATTEMPTS {
            match self.fetch_and_run_pipeline(call_id, recording_url).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(call_id = %call_id, attempt, error = %e, "recording pipeline attempt failed");
                    last_err = Some(e);
                    tokio::time::sleep(Duration::from_secs(2u64.saturating_pow(attempt))).await;
                }
            }
        }
        Err(last_err.unwrap_or_else(|| CoreError::Carrier("recording pipeline exhausted retries".to_string())))
    }

    async fn fetch_and_run_pipeline(&self, call_id: CallId, recording_url: &str) -> Result<(), CoreError> {
        let blob = reqwest::get(recording_url)
            .await
            .map_err(|e| CoreError::Carrier(e.to_string()))?
            .bytes()
            .await
            .map_err(|e| CoreError::Carrier(e.to_string()))?;
        self.process_utterance(call_id, blob.to_vec()).await;
        Ok(())
    }

    /// **recording-status** handling (§4.10): append an audit event.
    pub async fn handle_recording_status(&self, call_id: CallId, status: String, recording_sid: Option<String>) {
        let _ = self
            .call_store
            .append_recording_event(
                call_id,
                RecordingEvent {
                    timestamp: Utc::now(),
                    kind: RecordingEventKind::RecordingStatus,
                    recording_sid,
                    status,
                },
            )
            .await;
    }

    /// Shared STT → guard → classify → respond → TTS pipeline, run once
    /// per utterance regardless of whether it arrived via a carrier
    /// recording or the realtime media-stream WebSocket (§5 "at most one
    /// inference pipeline is active at any instant").
    async fn process_utterance(&self, call_id: CallId, wav_blob: Vec<u8>) {
        let transcription = match self
            .stt_queue
            .enqueue(call_id, wav_blob.clone(), EnqueueOptions::default())
            .wait()
            .await
        {
            Ok(t) => t,
            Err(e) => {
                warn!(call_id = %call_id, error = %e, "stt failed, treating as silence");
                return;
            }
        };

        let verdict = hallucination_guard::classify_utterance(&transcription.text, wav_blob.len(), transcription.duration.as_secs_f32());

        let Some(session_arc) = self.sessions.get(&call_id).map(|r| r.clone()) else {
            warn!(call_id = %call_id, "no dialog session for call, dropping utterance");
            return;
        };
        let mut session = session_arc.lock().await;

        if verdict.is_hallucination() || verdict.is_silence() {
            session.silence.record(transcription.duration);
            let outcome = silence_policy::prescribe(&verdict, &session.silence, session.stage == Stage::Negotiation);
            let reply = silence_policy::synthesize_outcome(&self.tts, &outcome).await;
            drop(session);
            if let Some(result) = reply {
                let fallback_text = outcome.reply_text.as_deref().unwrap_or_default();
                let pending = self.stage_tts_result(call_id, fallback_text, result);
                self.stage_reply(call_id, pending).await;
            }
            if !outcome.should_continue {
                self.end(call_id, TerminalReason::Abandoned).await;
            }
            return;
        }
        session.silence.reset();

        let callee_turn = ConversationTurn {
            timestamp: Utc::now(),
            speaker: Speaker::Callee,
            text: transcription.text.clone(),
            intent: None,
        };
        session.append_turn(callee_turn.clone());
        let _ = self.call_store.append_turn(call_id, callee_turn).await;

        let intent = match tokio::time::timeout(
            RESPONSE_SOFT_TIMEOUT,
            self.llm_queue.enqueue(call_id, transcription.text.clone(), EnqueueOptions::default()).wait(),
        )
        .await
        {
            Ok(Ok(intent)) => intent,
            Ok(Err(e)) => {
                warn!(call_id = %call_id, error = %e, "llm classification exhausted retries, using keyword fallback");
                crate::dialog::classifier::classify_by_keywords(&transcription.text)
            }
            Err(_) => {
                warn!(call_id = %call_id, "classification exceeded soft timeout, defaulting to neutral");
                Intent::Neutral
            }
        };

        let from_stage = session.stage;
        let repeat = session.repeat_count(from_stage, intent);
        let transition = match self.script_table.lookup(from_stage, intent, repeat) {
            Some(rule) => state_machine::Transition {
                reply_template: rule.reply_template,
                next_stage: rule.next_stage,
                priority: state_machine::ReplyPriority::Normal,
            },
            None => state_machine::next(from_stage, intent, repeat),
        };

        let recent_history = session.history.clone();
        let is_unusual_length = {
            let len = transcription.text.chars().count();
            len < 3 || len > 300
        };
        let repeats_recent_history = recent_history
            .iter()
            .rev()
            .find(|t| t.speaker == Speaker::Callee)
            .is_some_and(|t| t.text.eq_ignore_ascii_case(&transcription.text));
        let is_off_topic = response_selector::is_off_topic(&transcription.text);
        let method =
            response_selector::select_method(&transcription.text, repeat, is_off_topic, is_unusual_length, repeats_recent_history, false);

        let client = match self.call_store.get(call_id).await {
            Ok(call) => self.client_store.get(&call.client_id).await.ok(),
            Err(_) => None,
        };
        let templated = match &client {
            Some(c) => response_selector::personalize(
                &transition.reply_template,
                &c.name,
                &c.company,
                c.debt_amount,
                &c.contract_ref,
                c.partial_payment_offer,
            ),
            None => transition.reply_template.clone(),
        };

        // C6 "generated" path (§4.6): ask the LLM for a free-text reply
        // instead of the templated transition; any failure, timeout, or
        // missing client record falls back to the templated reply so a
        // degraded generation vendor never stalls the call.
        let generated = if method == ReplyMethod::Generated {
            match &client {
                Some(c) => {
                    let request = GenerationRequest {
                        transcript: transcription.text.clone(),
                        stage: from_stage,
                        recent_history: recent_history.clone(),
                        client_name: c.name.clone(),
                        company: c.company.clone(),
                        debt_amount: c.debt_amount,
                    };
                    match tokio::time::timeout(
                        RESPONSE_SOFT_TIMEOUT,
                        self.generate_queue.enqueue(call_id, request, EnqueueOptions::default()).wait(),
                    )
                    .await
                    {
                        Ok(Ok(text)) => Some(text),
                        Ok(Err(e)) => {
                            warn!(call_id = %call_id, error = %e, "generated-reply job exhausted retries, using templated reply");
                            None
                        }
                        Err(_) => {
                            warn!(call_id = %call_id, "generated-reply exceeded soft timeout, using templated reply");
                            None
                        }
                    }
                }
                None => None,
            }
        } else {
            None
        };

        let rendered = generated.unwrap_or(templated);
        let validated = response_selector::validate(&rendered).to_string();

        session.advance(from_stage, intent, transition.next_stage);
        let agent_turn = ConversationTurn {
            timestamp: Utc::now(),
            speaker: Speaker::Agent,
            text: validated.clone(),
            intent: Some(intent),
        };
        session.append_turn(agent_turn.clone());
        drop(session);
        let _ = self.call_store.append_turn(call_id, agent_turn).await;

        let is_terminal = transition.next_stage.is_terminal();
        let priority = matches!(transition.priority, state_machine::ReplyPriority::Urgent);
        let pending = self.synthesize_and_stage(call_id, &validated, priority).await;
        self.stage_reply(call_id, pending).await;

        if is_terminal {
            let reason = match intent {
                Intent::HangUp => TerminalReason::HangUp,
                _ => TerminalReason::Agreement,
            };
            self.end(call_id, reason).await;
        }
    }

    async fn stage_reply(&self, call_id: CallId, pending: PendingAudio) {
        self.send_media_stream_reply(call_id, &pending).await;
        if let Some(slot) = self.pending_audio.get(&call_id) {
            *slot.lock().await = Some(pending);
        }
    }

    /// If this call has a live `/media-stream` connection, push the reply
    /// audio down it as raw μ-law bytes for the handler to frame and send
    /// (§4.11). A no-op for calls using only the carrier-recording path.
    async fn send_media_stream_reply(&self, call_id: CallId, pending: &PendingAudio) {
        let Some(sender) = self.media_replies.get(&call_id).map(|r| r.clone()) else {
            return;
        };

        let audio_prefix = format!("{}/audio/", self.config.server.server_url.trim_end_matches('/'));
        let wav_bytes = match pending {
            PendingAudio::Primary { url } | PendingAudio::Cache { url } => {
                self.audio_store.read(url.trim_start_matches(&audio_prefix)).ok()
            }
            PendingAudio::Fallback { .. } => None,
        };
        let Some(wav_bytes) = wav_bytes else {
            return;
        };

        match crate::voice::vad::wav_to_mulaw(&wav_bytes) {
            Some(mulaw) => {
                let _ = sender.send(mulaw);
            }
            None => warn!(call_id = %call_id, "failed to convert reply audio to mulaw for media stream"),
        }
    }

    /// `end(call-id, reason)` (§4.10): idempotent, persists the final
    /// state, purges the session.
    pub async fn end(&self, call_id: CallId, reason: TerminalReason) {
        let status = match reason {
            TerminalReason::HangUp | TerminalReason::Agreement => CallStatus::Completed,
            TerminalReason::Abandoned | TerminalReason::Flagged => CallStatus::Completed,
            TerminalReason::ServerShutdown | TerminalReason::Error => CallStatus::Failed,
        };
        let result = CallResult {
            agreement: matches!(reason, TerminalReason::Agreement),
            promised_payment: None,
            next_contact_date: None,
            notes: Vec::new(),
            terminal_reason: reason,
        };
        let _ = self.call_store.finalize(call_id, status, Utc::now(), result).await;
        self.sessions.remove(&call_id);
        self.guards.remove(&call_id);
        self.pending_audio.remove(&call_id);
        info!(call_id = %call_id, ?reason, "call ended");
    }

    /// Append a carrier recording to the audit trail (separate from
    /// recording-status events; used when the recording webhook itself
    /// carries enough metadata to record without waiting on processing).
    pub async fn record_recording(&self, call_id: CallId, url: String, duration: Duration, transcription: String) {
        let _ = self
            .call_store
            .append_recording(
                call_id,
                Recording {
                    url,
                    duration,
                    transcription,
                    intent: None,
                },
            )
            .await;
    }
}

#[async_trait::async_trait]
impl media_stream::UtteranceSink for CallOrchestrator {
    /// Runs the same guarded pipeline the recording path uses, so a call
    /// using the realtime media stream gets identical dialog behavior
    /// (§4.11 "shares C12's pipeline stages").
    async fn on_utterance(self: Arc<Self>, call_id: CallId, wav_blob: Vec<u8>) {
        let guards = self.guards_for(call_id);
        if guards.is_processing.swap(true, Ordering::SeqCst) {
            debug!(call_id = %call_id, "pipeline already processing, dropping media-stream utterance");
            return;
        }
        self.process_utterance(call_id, wav_blob).await;
        guards.is_processing.store(false, Ordering::SeqCst);
    }

    fn is_call_active(&self, call_id: CallId) -> bool {
        self.sessions.contains_key(&call_id)
    }

    fn register_reply_sink(&self, call_id: CallId, sender: mpsc::UnboundedSender<Vec<u8>>) {
        self.media_replies.insert(call_id, sender);
    }

    fn unregister_reply_sink(&self, call_id: CallId) {
        self.media_replies.remove(&call_id);
    }
}

impl TerminalReason {
    fn from_status(status: CallStatus) -> Self {
        match status {
            CallStatus::Failed => TerminalReason::Error,
            CallStatus::Busy | CallStatus::NoAnswer => TerminalReason::Abandoned,
            CallStatus::Canceled => TerminalReason::Abandoned,
            _ => TerminalReason::HangUp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{InMemoryCallStore, InMemoryClientStore};
    use crate::types::Client;

    fn test_orchestrator() -> Arc<CallOrchestrator> {
        let config = Arc::new(Config::for_tests());
        let call_store: Arc<dyn CallStore> = Arc::new(InMemoryCallStore::new());
        let client_store = Arc::new(InMemoryClientStore::new());
        client_store.seed(Client {
            id: "c1".to_string(),
            name: "Ivan Petrov".to_string(),
            phone: "+70000000000".to_string(),
            debt_amount: 50000.0,
            company: "Acme Collections".to_string(),
            contract_ref: "K-123".to_string(),
            partial_payment_offer: None,
        });
        let client_store: Arc<dyn ClientStore> = client_store;
        let carrier = Arc::new(CarrierClient::new(config.carrier.clone()));
        // Leaked deliberately: the directory must outlive the orchestrator
        // for the duration of the test process.
        let audio_dir: &'static tempfile::TempDir = Box::leak(Box::new(tempfile::tempdir().unwrap()));
        let audio_store = Arc::new(AudioStore::new(audio_dir.path(), config.server.server_url.clone()).unwrap());
        let phrase_cache = Arc::new(PhraseCache::new(audio_store.clone(), 32));
        let tts = Arc::new(TtsEngine::new(config.tts.clone(), Some(phrase_cache.clone())));
        let stt = Arc::new(SttEngine::new(config.stt.clone()));
        let classifier = Arc::new(Classifier::new(config.llm.api_key.clone(), config.llm.response_timeout));
        let script_table = Arc::new(ScriptTable::empty());

        CallOrchestrator::new(
            config,
            call_store,
            client_store,
            carrier,
            audio_store,
            phrase_cache,
            tts,
            stt,
            classifier,
            script_table,
        )
    }

    #[tokio::test]
    async fn end_is_idempotent() {
        let orchestrator = test_orchestrator();
        let call_id = CallId::new_v4();
        orchestrator
            .call_store
            .create(Call::new(call_id, "c1".to_string()))
            .await
            .unwrap();
        orchestrator.end(call_id, TerminalReason::HangUp).await;
        orchestrator.end(call_id, TerminalReason::Error).await;
        let call = orchestrator.call_store.get(call_id).await.unwrap();
        assert_eq!(call.status, CallStatus::Completed);
    }

    #[tokio::test]
    async fn markup_request_without_pending_audio_returns_safe_error() {
        let orchestrator = test_orchestrator();
        let call_id = CallId::new_v4();
        let markup = orchestrator.handle_markup_request(call_id).await;
        assert!(markup.render().contains("Hangup") || markup.render().contains("Say"));
    }

    #[tokio::test]
    async fn duplicate_recording_available_is_a_no_op() {
        let orchestrator = test_orchestrator();
        let call_id = CallId::new_v4();
        orchestrator
            .call_store
            .create(Call::new(call_id, "c1".to_string()))
            .await
            .unwrap();
        let guards = orchestrator.guards_for(call_id);
        guards.is_processing.store(true, Ordering::SeqCst);
        // Second call observes the guard already set and must not spawn
        // a second pipeline run; we only assert it returns promptly with
        // a redirect rather than blocking.
        let markup = orchestrator
            .handle_recording_available(call_id, "https://example.com/rec.wav".to_string(), None)
            .await;
        assert!(markup.render().contains("Redirect"));
    }
}
