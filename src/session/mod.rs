//! Session layer
//!
//! Each session's state is owned by a single actor task: connections,
//! pipeline runs, and the expiry supervisor all talk to it by message.
//! The actor implements the outbound send contract (sequence stamping and
//! the bounded replay buffer), inbound dedup, the one-active-run rule with
//! its single commit point, and the ambient listener's stateful half.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::Utc;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use crate::ambient::{self, NoiseBaseline, TriggerReason};
use crate::audio;
use crate::config::Config;
use crate::pipeline::{self, RunContext, RunInput, RunOutcome};
use crate::protocol::{
    encode_frame, ClientEnvelope, PipelineState, SentEnvelope, ServerEnvelope, SmartState,
};
use crate::services::asr::Transcript;
use crate::services::speaker::SpeakerIdentity;
use crate::services::tts::TtsEngineId;
use crate::services::Services;
use crate::types::{AmbientEntry, ConversationTurn, DeviceCapabilities};

/// Outbound envelopes retained for reconnect replay
const REPLAY_BUFFER: usize = 40;

/// Ambient context bounds
const AMBIENT_MAX_ENTRIES: usize = 20;
const AMBIENT_MAX_AGE_SECS: i64 = 5 * 60;

/// Session reclaimed after this long with no attached connection
const SESSION_IDLE_EXPIRY: Duration = Duration::from_secs(5 * 60);

/// Expiry supervisor probe interval
const EXPIRY_PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// Messages accepted by a session actor
pub enum SessionMsg {
    /// A connection (re-)attached; replay everything past `last_server_seq`
    Attach {
        out: mpsc::UnboundedSender<String>,
        last_server_seq: u64,
    },
    Detach,
    Inbound {
        cseq: Option<u64>,
        envelope: ClientEnvelope,
    },
    /// Outbound emission from a pipeline run or helper task
    Emit {
        run_id: Option<u64>,
        envelope: ServerEnvelope,
    },
    RunFinished {
        run_id: u64,
    },
    /// Joined ASR + speaker-ID result for one ambient segment
    AmbientResult {
        rms: f32,
        transcript: Result<Transcript, String>,
        identity: SpeakerIdentity,
    },
    Shutdown,
}

/// Attach state shared with the expiry supervisor
pub struct SessionMeta {
    attached: AtomicBool,
    detached_at: std::sync::Mutex<Instant>,
}

impl SessionMeta {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            attached: AtomicBool::new(false),
            detached_at: std::sync::Mutex::new(Instant::now()),
        })
    }

    fn set_attached(&self, attached: bool) {
        self.attached.store(attached, Ordering::SeqCst);
        if !attached {
            if let Ok(mut at) = self.detached_at.lock() {
                *at = Instant::now();
            }
        }
    }

    fn is_expired(&self, idle: Duration) -> bool {
        if self.attached.load(Ordering::SeqCst) {
            return false;
        }
        self.detached_at
            .lock()
            .map(|at| at.elapsed() > idle)
            .unwrap_or(false)
    }
}

struct SessionHandle {
    tx: mpsc::UnboundedSender<SessionMsg>,
    meta: Arc<SessionMeta>,
}

/// Per-session defaults resolved from configuration
#[derive(Clone)]
struct SessionDefaults {
    wake_name: String,
    owner_name: Option<String>,
    tts_engine: TtsEngineId,
}

/// Owns the session map and spawns one actor per session
pub struct SessionManager {
    sessions: Mutex<HashMap<String, SessionHandle>>,
    services: Arc<Services>,
    defaults: SessionDefaults,
}

impl SessionManager {
    pub fn new(config: &Config, services: Arc<Services>) -> Arc<Self> {
        let defaults = SessionDefaults {
            wake_name: config.assistant.wake_name.clone(),
            owner_name: config.assistant.owner_name.clone(),
            tts_engine: TtsEngineId::from_name(&config.tts.engine).unwrap_or(TtsEngineId::Cloud),
        };
        Arc::new(Self { sessions: Mutex::new(HashMap::new()), services, defaults })
    }

    /// Attach a freshly authenticated connection.
    ///
    /// Re-attaches to a live session when the client presented a valid
    /// prior id; otherwise mints a new session (and resets speaker
    /// profiles so earlier sessions cannot contaminate identification).
    pub async fn attach(
        &self,
        requested: Option<String>,
        last_server_seq: u64,
        out: mpsc::UnboundedSender<String>,
    ) -> (String, mpsc::UnboundedSender<SessionMsg>) {
        let mut sessions = self.sessions.lock().await;

        if let Some(id) = requested {
            if let Some(handle) = sessions.get(&id) {
                if handle
                    .tx
                    .send(SessionMsg::Attach { out: out.clone(), last_server_seq })
                    .is_ok()
                {
                    handle.meta.set_attached(true);
                    info!("Re-attached connection to session {}", id);
                    return (id, handle.tx.clone());
                }
                sessions.remove(&id);
            }
        }

        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        let meta = SessionMeta::new();
        meta.set_attached(true);

        let actor = SessionActor::new(
            id.clone(),
            self.services.clone(),
            self.defaults.clone(),
            tx.clone(),
            meta.clone(),
        );
        tokio::spawn(actor.run(rx));

        let _ = tx.send(SessionMsg::Attach { out, last_server_seq });
        sessions.insert(id.clone(), SessionHandle { tx: tx.clone(), meta });

        // Fresh session: clear speaker profiles from prior sessions
        let services = self.services.clone();
        tokio::spawn(async move {
            if let Err(e) = services.speaker.reset().await {
                debug!("Speaker reset on fresh session failed: {:#}", e);
            }
        });

        info!("Created session {}", id);
        (id, tx)
    }

    /// Periodically reap sessions that stayed detached past the idle bound.
    pub async fn run_expiry_supervisor(self: Arc<Self>) {
        loop {
            tokio::time::sleep(EXPIRY_PROBE_INTERVAL).await;
            let mut sessions = self.sessions.lock().await;
            sessions.retain(|id, handle| {
                if handle.meta.is_expired(SESSION_IDLE_EXPIRY) {
                    info!("Session {} expired", id);
                    let _ = handle.tx.send(SessionMsg::Shutdown);
                    false
                } else {
                    true
                }
            });
        }
    }

}

/// Mutable state owned by one actor
struct SessionState {
    history: Vec<ConversationTurn>,
    ambient: Vec<AmbientEntry>,
    next_seq: u64,
    replay: VecDeque<SentEnvelope>,
    last_cseq: u64,
    has_cseq: bool,
    wake_name: String,
    tts_engine: TtsEngineId,
    owner_label: Option<String>,
    capabilities: DeviceCapabilities,
    noise: NoiseBaseline,
    ambient_busy: bool,
    device_pending: HashSet<String>,
    device_done: HashSet<String>,
}

impl SessionState {
    fn new(defaults: &SessionDefaults) -> Self {
        Self {
            history: Vec::new(),
            ambient: Vec::new(),
            next_seq: 0,
            replay: VecDeque::new(),
            last_cseq: 0,
            has_cseq: false,
            wake_name: defaults.wake_name.clone(),
            tts_engine: defaults.tts_engine,
            owner_label: None,
            capabilities: DeviceCapabilities::default(),
            noise: NoiseBaseline::default(),
            ambient_busy: false,
            device_pending: HashSet::new(),
            device_done: HashSet::new(),
        }
    }

    fn push_history(&mut self, turn: ConversationTurn) {
        self.history.push(turn);
        let max = crate::pipeline::prompt::HISTORY_EXCHANGES * 2;
        while self.history.len() > max {
            self.history.remove(0);
        }
    }

    fn push_ambient(&mut self, entry: AmbientEntry) {
        self.ambient.push(entry);
        let newest = match self.ambient.last() {
            Some(e) => e.timestamp,
            None => return,
        };
        self.ambient
            .retain(|e| (newest - e.timestamp).num_seconds() <= AMBIENT_MAX_AGE_SECS);
        while self.ambient.len() > AMBIENT_MAX_ENTRIES {
            self.ambient.remove(0);
        }
    }
}

struct ActiveRun {
    run_id: u64,
    cancel: watch::Sender<bool>,
    cancelling: bool,
    handle: tokio::task::JoinHandle<RunOutcome>,
}

/// The per-session actor
struct SessionActor {
    id: String,
    state: SessionState,
    services: Arc<Services>,
    defaults: SessionDefaults,
    tx: mpsc::UnboundedSender<SessionMsg>,
    meta: Arc<SessionMeta>,
    out: Option<mpsc::UnboundedSender<String>>,
    active: Option<ActiveRun>,
    run_counter: u64,
}

impl SessionActor {
    fn new(
        id: String,
        services: Arc<Services>,
        defaults: SessionDefaults,
        tx: mpsc::UnboundedSender<SessionMsg>,
        meta: Arc<SessionMeta>,
    ) -> Self {
        let state = SessionState::new(&defaults);
        Self { id, state, services, defaults, tx, meta, out: None, active: None, run_counter: 0 }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SessionMsg>) {
        while let Some(msg) = rx.recv().await {
            match msg {
                SessionMsg::Attach { out, last_server_seq } => {
                    self.handle_attach(out, last_server_seq);
                }
                SessionMsg::Detach => {
                    self.out = None;
                    self.meta.set_attached(false);
                    debug!("Session {} detached", self.id);
                }
                SessionMsg::Inbound { cseq, envelope } => {
                    if self.accept_cseq(cseq) {
                        self.handle_inbound(envelope).await;
                    }
                }
                SessionMsg::Emit { run_id, envelope } => {
                    if self.allow_emit(run_id, &envelope) {
                        self.send_envelope(envelope);
                    }
                }
                SessionMsg::RunFinished { run_id } => {
                    let matches = self.active.as_ref().map(|a| a.run_id) == Some(run_id);
                    if matches {
                        if let Some(active) = self.active.take() {
                            match active.handle.await {
                                Ok(outcome) => self.commit(outcome),
                                Err(e) => warn!("Run task failed: {}", e),
                            }
                        }
                    }
                }
                SessionMsg::AmbientResult { rms, transcript, identity } => {
                    self.handle_ambient_result(rms, transcript, identity).await;
                }
                SessionMsg::Shutdown => {
                    if let Some(active) = self.active.take() {
                        let _ = active.cancel.send(true);
                        if let Ok(outcome) = active.handle.await {
                            self.commit(outcome);
                        }
                    }
                    debug!("Session {} shut down", self.id);
                    break;
                }
            }
        }
    }

    // ─── Outbound send contract ──────────────────────────────

    /// Run-scoped emissions from a superseded or cancelling run are
    /// filtered down to their terminal status/error envelopes.
    fn allow_emit(&self, run_id: Option<u64>, envelope: &ServerEnvelope) -> bool {
        let Some(rid) = run_id else { return true };
        let terminal = matches!(
            envelope,
            ServerEnvelope::Status { .. } | ServerEnvelope::Error { .. }
        );
        match &self.active {
            Some(active) if active.run_id == rid => !active.cancelling || terminal,
            _ => terminal,
        }
    }

    fn send_envelope(&mut self, envelope: ServerEnvelope) {
        if let ServerEnvelope::DeviceCommand { id, .. } = &envelope {
            self.state.device_pending.insert(id.clone());
        }

        let sseq = self.state.next_seq;
        self.state.next_seq += 1;

        let frame = encode_frame(&envelope, sseq, false);

        if !envelope.is_ephemeral() {
            if self.state.replay.len() >= REPLAY_BUFFER {
                self.state.replay.pop_front();
            }
            self.state.replay.push_back(SentEnvelope { sseq, payload: envelope });
        }

        if let Some(out) = &self.out {
            if out.send(frame).is_err() {
                self.out = None;
                self.meta.set_attached(false);
            }
        }
    }

    fn handle_attach(&mut self, out: mpsc::UnboundedSender<String>, last_server_seq: u64) {
        // Snapshot the buffer before the ack lands in it
        let replayed: Vec<(u64, String)> = self
            .state
            .replay
            .iter()
            .filter(|e| e.sseq > last_server_seq)
            .map(|e| (e.sseq, encode_frame(&e.payload, e.sseq, true)))
            .collect();

        self.out = Some(out);
        self.meta.set_attached(true);

        let server_seq = self.state.next_seq;
        self.send_envelope(ServerEnvelope::Auth {
            status: "ok".to_string(),
            session_id: self.id.clone(),
            server_seq,
        });

        if !replayed.is_empty() {
            info!("Replaying {} buffered envelopes (> {})", replayed.len(), last_server_seq);
        }
        if let Some(out) = &self.out {
            for (_, frame) in replayed {
                if out.send(frame).is_err() {
                    break;
                }
            }
        }
    }

    // ─── Inbound dispatch ────────────────────────────────────

    /// Advance the dedup cursor; envelopes at or below it are dropped.
    fn accept_cseq(&mut self, cseq: Option<u64>) -> bool {
        match cseq {
            Some(c) if self.state.has_cseq && c <= self.state.last_cseq => {
                debug!("Dropping duplicate inbound cseq={}", c);
                false
            }
            Some(c) => {
                self.state.has_cseq = true;
                self.state.last_cseq = c;
                true
            }
            None => true,
        }
    }

    async fn handle_inbound(&mut self, envelope: ClientEnvelope) {
        match envelope {
            ClientEnvelope::Auth { .. } => {
                debug!("Ignoring repeated auth on live connection");
            }
            ClientEnvelope::Text { text, prefix } => {
                self.start_run(RunInput::Text { text, prefix, ambient: false }).await;
            }
            ClientEnvelope::Audio { data, prefix } => match BASE64.decode(&data) {
                Ok(bytes) => {
                    let pcm = audio::ensure_pcm(&bytes);
                    self.start_run(RunInput::Audio { pcm, prefix }).await;
                }
                Err(_) => {
                    self.send_envelope(ServerEnvelope::Error {
                        message: "Invalid audio data".to_string(),
                    });
                }
            },
            ClientEnvelope::AmbientAudio { data } => {
                self.handle_ambient_segment(data);
            }
            ClientEnvelope::Image { data, mime, caption } => match BASE64.decode(&data) {
                Ok(bytes) => {
                    self.start_run(RunInput::Image { data: bytes, mime, caption }).await;
                }
                Err(_) => {
                    self.send_envelope(ServerEnvelope::Error {
                        message: "Invalid image data".to_string(),
                    });
                }
            },
            ClientEnvelope::File { data, name } => match BASE64.decode(&data) {
                Ok(bytes) => {
                    self.start_run(RunInput::File { data: bytes, name }).await;
                }
                Err(_) => {
                    self.send_envelope(ServerEnvelope::Error {
                        message: "Invalid file data".to_string(),
                    });
                }
            },
            ClientEnvelope::Cancel => {
                if !self.request_cancel() {
                    self.send_envelope(ServerEnvelope::Status { state: PipelineState::Idle });
                }
            }
            ClientEnvelope::BargeIn => {
                self.send_envelope(ServerEnvelope::StopPlayback);
                if !self.request_cancel() {
                    self.send_envelope(ServerEnvelope::Status { state: PipelineState::Idle });
                }
            }
            ClientEnvelope::ClearHistory => {
                self.state.history.clear();
                self.send_envelope(ServerEnvelope::HistoryCleared);
            }
            ClientEnvelope::Replay => {
                let frames: Vec<String> = self
                    .state
                    .replay
                    .iter()
                    .map(|e| encode_frame(&e.payload, e.sseq, true))
                    .collect();
                if let Some(out) = &self.out {
                    for frame in frames {
                        if out.send(frame).is_err() {
                            break;
                        }
                    }
                }
            }
            ClientEnvelope::SetBotName { name } => {
                info!("Session {} wake-name set to '{}'", self.id, name);
                self.state.wake_name = name;
                self.emit_settings();
            }
            ClientEnvelope::EnrollAudio { data, name, append } => {
                match BASE64.decode(&data) {
                    Ok(bytes) => {
                        let pcm = audio::ensure_pcm(&bytes);
                        let services = self.services.clone();
                        let tx = self.tx.clone();
                        tokio::spawn(async move {
                            let result =
                                services.speaker.enroll(&name, &pcm, audio::MIC_SAMPLE_RATE, append).await;
                            let envelope = match result {
                                Ok(()) => ServerEnvelope::EnrollResult { ok: true, name, message: None },
                                Err(e) => ServerEnvelope::EnrollResult {
                                    ok: false,
                                    name,
                                    message: Some(e.to_string()),
                                },
                            };
                            let _ = tx.send(SessionMsg::Emit { run_id: None, envelope });
                        });
                    }
                    Err(_) => {
                        self.send_envelope(ServerEnvelope::Error {
                            message: "Invalid enrollment audio".to_string(),
                        });
                    }
                }
            }
            ClientEnvelope::GetProfiles => {
                let services = self.services.clone();
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    let envelope = match services.speaker.profiles().await {
                        Ok(profiles) => ServerEnvelope::Profiles { profiles },
                        Err(e) => ServerEnvelope::Error { message: format!("Profiles unavailable: {}", e) },
                    };
                    let _ = tx.send(SessionMsg::Emit { run_id: None, envelope });
                });
            }
            ClientEnvelope::RenameSpeaker { old, new } => {
                let services = self.services.clone();
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    let envelope = match services.speaker.rename(&old, &new).await {
                        Ok(()) => ServerEnvelope::RenameResult { ok: true, message: None },
                        Err(e) => ServerEnvelope::RenameResult { ok: false, message: Some(e.to_string()) },
                    };
                    let _ = tx.send(SessionMsg::Emit { run_id: None, envelope });
                });
            }
            ClientEnvelope::ResetSpeakers => {
                let services = self.services.clone();
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    let ok = services.speaker.reset().await.is_ok();
                    let _ = tx.send(SessionMsg::Emit {
                        run_id: None,
                        envelope: ServerEnvelope::ResetResult { ok },
                    });
                });
                self.state.owner_label = None;
            }
            ClientEnvelope::SetTtsEngine { engine } => match TtsEngineId::from_name(&engine) {
                Some(id) => {
                    self.state.tts_engine = id;
                    self.send_envelope(ServerEnvelope::TtsEngine {
                        engine: id.as_str().to_string(),
                        status: "ok".to_string(),
                    });
                }
                None => {
                    self.send_envelope(ServerEnvelope::Error {
                        message: format!(
                            "Unknown TTS engine '{}'. Available: {}",
                            engine,
                            TtsEngineId::all_names().join(", ")
                        ),
                    });
                }
            },
            ClientEnvelope::GetSettings => {
                self.emit_settings();
            }
            ClientEnvelope::Ping => {
                self.send_envelope(ServerEnvelope::Pong);
            }
            ClientEnvelope::Capabilities { capabilities } => {
                debug!("Session {} capabilities: {:?}", self.id, capabilities);
                self.state.capabilities = capabilities;
            }
            ClientEnvelope::DeviceResponse { id, result } => {
                if self.state.device_pending.remove(&id) {
                    debug!("Device response for {}: {}", id, result);
                    self.state.device_done.insert(id);
                } else if self.state.device_done.contains(&id) {
                    debug!("Duplicate device response for {} ignored", id);
                } else {
                    warn!("Device response for unknown command {}", id);
                }
            }
            ClientEnvelope::Unknown => {
                warn!("Dropping envelope with unknown type");
            }
        }
    }

    fn emit_settings(&mut self) {
        self.send_envelope(ServerEnvelope::Settings {
            wake_name: self.state.wake_name.clone(),
            tts_engine: self.state.tts_engine.as_str().to_string(),
            owner_name: self.defaults.owner_name.clone(),
        });
    }

    // ─── Run lifecycle ───────────────────────────────────────

    /// Signal cancellation of the active run. Returns false when no run
    /// was active.
    fn request_cancel(&mut self) -> bool {
        match &mut self.active {
            Some(active) => {
                if !active.cancelling {
                    active.cancelling = true;
                    let _ = active.cancel.send(true);
                }
                true
            }
            None => false,
        }
    }

    /// Start a run, first cancelling and committing any prior one so that
    /// exactly one run is ever active.
    async fn start_run(&mut self, input: RunInput) {
        if let Some(active) = self.active.take() {
            let _ = active.cancel.send(true);
            match active.handle.await {
                Ok(outcome) => self.commit(outcome),
                Err(e) => warn!("Cancelled run task failed: {}", e),
            }
        }

        self.run_counter += 1;
        let run_id = self.run_counter;
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let ctx = RunContext {
            run_id,
            session_tx: self.tx.clone(),
            cancel: cancel_rx,
            services: self.services.clone(),
            history: self.state.history.clone(),
            tts_engine: self.state.tts_engine,
        };

        let handle = tokio::spawn(pipeline::run_pipeline(ctx, input));
        self.active = Some(ActiveRun { run_id, cancel: cancel_tx, cancelling: false, handle });
    }

    /// Single commit point for run outcomes (including cancelled ones).
    fn commit(&mut self, outcome: RunOutcome) {
        let assistant = outcome.assistant_text.trim().to_string();

        if outcome.cancelled {
            // Preserve context for the next turn only when text accumulated
            if !assistant.is_empty() {
                if let Some(user) = outcome.user_text {
                    self.state.push_history(ConversationTurn::user(user));
                }
                self.state
                    .push_history(ConversationTurn::assistant(format!("{} [interrupted]", assistant)));
            }
            return;
        }

        if let Some(user) = outcome.user_text {
            if !assistant.is_empty() {
                self.state.push_history(ConversationTurn::user(user));
                self.state.push_history(ConversationTurn::assistant(assistant));
            }
        }
    }

    // ─── Ambient segments ────────────────────────────────────

    /// One segment in flight at a time; extra segments are dropped, not
    /// queued, so a slow ASR call cannot pile up work.
    fn handle_ambient_segment(&mut self, data: String) {
        if self.state.ambient_busy {
            debug!("Ambient slot busy, dropping segment");
            return;
        }

        let bytes = match BASE64.decode(&data) {
            Ok(b) => b,
            Err(_) => {
                debug!("Undecodable ambient segment dropped");
                return;
            }
        };

        self.state.ambient_busy = true;
        self.send_envelope(ServerEnvelope::SmartStatus { state: SmartState::Transcribing });

        let pcm = audio::ensure_pcm(&bytes);
        let services = self.services.clone();
        let tx = self.tx.clone();

        tokio::spawn(async move {
            let samples = audio::pcm_bytes_to_samples(&pcm);
            let rms = audio::rms_energy(&samples);

            let (transcript, identity) = tokio::join!(
                services.asr.transcribe(&pcm, audio::MIC_SAMPLE_RATE),
                services.speaker.identify(&pcm, audio::MIC_SAMPLE_RATE),
            );

            let identity = identity.unwrap_or_else(|e| {
                debug!("Speaker-ID unavailable, treating speaker as unknown: {:#}", e);
                SpeakerIdentity::unknown()
            });

            let _ = tx.send(SessionMsg::AmbientResult {
                rms,
                transcript: transcript.map_err(|e| e.to_string()),
                identity,
            });
        });
    }

    async fn handle_ambient_result(
        &mut self,
        rms: f32,
        transcript: Result<Transcript, String>,
        identity: SpeakerIdentity,
    ) {
        self.state.ambient_busy = false;
        self.state.noise.record(rms);

        let transcript = match transcript {
            Ok(t) => t,
            Err(e) => {
                debug!("Ambient transcription failed: {}", e);
                self.send_envelope(ServerEnvelope::SmartStatus { state: SmartState::Listening });
                return;
            }
        };

        let min_words = self.state.noise.min_words();
        if let Err(reason) = ambient::accept_transcript(&transcript, min_words) {
            debug!("Ambient segment dropped: {:?}", reason);
            self.send_envelope(ServerEnvelope::SmartStatus { state: SmartState::Listening });
            return;
        }

        // Self-introduction: rename the anonymous label, best effort
        let mut speaker = identity.label.clone();
        if identity.is_anonymous() {
            if let Some(name) = ambient::detect_self_intro(&transcript.text) {
                info!("Self-introduction detected: '{}' -> '{}'", identity.label, name);
                let services = self.services.clone();
                let old = identity.label.clone();
                let renamed = name.clone();
                tokio::spawn(async move {
                    if let Err(e) = services.speaker.rename(&old, &renamed).await {
                        debug!("Speaker rename failed: {:#}", e);
                    }
                });
                speaker = name;
            }
        }

        // First distinct speaker becomes the owner while no profiles exist
        let is_owner = if self.state.owner_label.is_none() && !identity.has_profiles {
            self.state.owner_label = Some(speaker.clone());
            true
        } else {
            self.state.owner_label.as_deref() == Some(speaker.as_str())
                || self.defaults.owner_name.as_deref() == Some(speaker.as_str())
        };

        let entry = AmbientEntry {
            text: transcript.text.clone(),
            speaker: speaker.clone(),
            is_owner,
            timestamp: Utc::now(),
        };

        let decision = ambient::decide_trigger(&transcript.text, &self.state.wake_name);
        let run_input = if decision.respond {
            match decision.reason {
                Some(TriggerReason::Name) => Some((
                    format!(
                        "[{}]: {}",
                        speaker,
                        ambient::strip_wake_name(&transcript.text, &self.state.wake_name)
                    ),
                    false,
                )),
                _ => Some((ambient::ambient_wrapper(&self.state.ambient, &entry), true)),
            }
        } else {
            None
        };

        self.state.push_ambient(entry);
        self.send_envelope(ServerEnvelope::AmbientTranscript {
            text: transcript.text,
            speaker,
            is_owner,
            is_known: identity.known,
        });

        match run_input {
            Some((text, ambient_wrapped)) => {
                self.start_run(RunInput::Text { text, prefix: None, ambient: ambient_wrapped })
                    .await;
            }
            None => {
                self.send_envelope(ServerEnvelope::SmartStatus { state: SmartState::Listening });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_actor() -> (SessionActor, mpsc::UnboundedReceiver<String>) {
        let config = Config::default();
        let services = Services::from_config(&config);
        let defaults = SessionDefaults {
            wake_name: "jarvis".to_string(),
            owner_name: None,
            tts_engine: TtsEngineId::Cloud,
        };
        let (tx, _rx) = mpsc::unbounded_channel();
        let meta = SessionMeta::new();
        let mut actor = SessionActor::new("s1".to_string(), services, defaults, tx, meta);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        actor.out = Some(out_tx);
        (actor, out_rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<serde_json::Value> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(serde_json::from_str(&frame).unwrap());
        }
        frames
    }

    #[tokio::test]
    async fn sseq_strictly_increases_and_skips_ephemeral_buffering() {
        let (mut actor, mut out) = test_actor();

        actor.send_envelope(ServerEnvelope::Pong);
        actor.send_envelope(ServerEnvelope::StreamDone);
        actor.send_envelope(ServerEnvelope::Pong);

        let frames = drain(&mut out);
        let seqs: Vec<u64> = frames.iter().map(|f| f["sseq"].as_u64().unwrap()).collect();
        assert_eq!(seqs, vec![0, 1, 2]);

        // Only the non-ephemeral envelope was buffered
        assert_eq!(actor.state.replay.len(), 1);
        assert_eq!(actor.state.replay[0].sseq, 1);
    }

    #[tokio::test]
    async fn replay_buffer_is_bounded_ring() {
        let (mut actor, _out) = test_actor();
        for i in 0..60 {
            actor.send_envelope(ServerEnvelope::Transcript { text: format!("t{}", i) });
        }
        assert_eq!(actor.state.replay.len(), REPLAY_BUFFER);
        // Contiguous suffix of emitted history
        assert_eq!(actor.state.replay.front().unwrap().sseq, 20);
        assert_eq!(actor.state.replay.back().unwrap().sseq, 59);
    }

    #[tokio::test]
    async fn reattach_replays_past_cursor_with_flag() {
        let (mut actor, mut out) = test_actor();
        for i in 0..5 {
            actor.send_envelope(ServerEnvelope::Transcript { text: format!("t{}", i) });
        }
        drain(&mut out);

        let (out2_tx, mut out2_rx) = mpsc::unbounded_channel();
        actor.handle_attach(out2_tx, 2);

        let frames = drain(&mut out2_rx);
        // Auth ack first, then sseq 3 and 4 replayed
        assert_eq!(frames[0]["type"], "auth");
        assert_eq!(frames[0]["serverSeq"], 5);
        let replayed: Vec<(u64, bool)> = frames[1..]
            .iter()
            .map(|f| (f["sseq"].as_u64().unwrap(), f["replay"].as_bool().unwrap_or(false)))
            .collect();
        assert_eq!(replayed, vec![(3, true), (4, true)]);
    }

    #[tokio::test]
    async fn duplicate_cseq_is_dropped() {
        let (mut actor, _out) = test_actor();
        assert!(actor.accept_cseq(Some(1)));
        assert!(actor.accept_cseq(Some(2)));
        assert!(!actor.accept_cseq(Some(2)));
        assert!(!actor.accept_cseq(Some(1)));
        assert!(actor.accept_cseq(Some(3)));
        // Envelopes without a hint always pass
        assert!(actor.accept_cseq(None));
    }

    #[tokio::test]
    async fn commit_cancelled_with_text_marks_interrupted() {
        let (mut actor, _out) = test_actor();
        actor.commit(RunOutcome {
            user_text: Some("hola".to_string()),
            assistant_text: "Partial reply".to_string(),
            cancelled: true,
            errored: false,
        });
        assert_eq!(actor.state.history.len(), 2);
        assert_eq!(actor.state.history[1].content, "Partial reply [interrupted]");
    }

    #[tokio::test]
    async fn commit_cancelled_without_text_commits_nothing() {
        let (mut actor, _out) = test_actor();
        actor.commit(RunOutcome {
            user_text: Some("hola".to_string()),
            assistant_text: "   ".to_string(),
            cancelled: true,
            errored: false,
        });
        assert!(actor.state.history.is_empty());
    }

    #[tokio::test]
    async fn history_bounded_to_window() {
        let (mut actor, _out) = test_actor();
        for i in 0..30 {
            actor.commit(RunOutcome {
                user_text: Some(format!("u{}", i)),
                assistant_text: format!("a{}", i),
                cancelled: false,
                errored: false,
            });
        }
        assert_eq!(actor.state.history.len(), crate::pipeline::prompt::HISTORY_EXCHANGES * 2);
        assert_eq!(actor.state.history[0].content, "u20");
    }

    #[tokio::test]
    async fn ambient_context_pruned_by_age_and_count() {
        let (mut actor, _out) = test_actor();
        let old = Utc::now() - chrono::Duration::seconds(10 * 60);
        actor.state.push_ambient(AmbientEntry {
            text: "old".into(),
            speaker: "A".into(),
            is_owner: false,
            timestamp: old,
        });
        for i in 0..25 {
            actor.state.push_ambient(AmbientEntry {
                text: format!("e{}", i),
                speaker: "A".into(),
                is_owner: false,
                timestamp: Utc::now(),
            });
        }
        assert!(actor.state.ambient.len() <= AMBIENT_MAX_ENTRIES);
        assert!(actor.state.ambient.iter().all(|e| e.text != "old"));
    }

    #[tokio::test]
    async fn stale_run_emissions_filtered_to_terminal() {
        let (mut actor, mut out) = test_actor();
        // No active run: chunk-type emissions from a stale run are dropped
        assert!(!actor.allow_emit(
            Some(7),
            &ServerEnvelope::ReplyChunk {
                text: "x".into(),
                index: 0,
                emotion: crate::protocol::Emotion::Neutral
            }
        ));
        assert!(actor.allow_emit(
            Some(7),
            &ServerEnvelope::Status { state: PipelineState::Idle }
        ));
        // Unscoped emissions always pass
        assert!(actor.allow_emit(None, &ServerEnvelope::Pong));
        let _ = drain(&mut out);
    }

    #[tokio::test]
    async fn set_tts_engine_validates_closed_set() {
        let (mut actor, mut out) = test_actor();
        actor
            .handle_inbound(ClientEnvelope::SetTtsEngine { engine: "gpu_fast".to_string() })
            .await;
        actor
            .handle_inbound(ClientEnvelope::SetTtsEngine { engine: "robotic".to_string() })
            .await;

        let frames = drain(&mut out);
        assert_eq!(frames[0]["type"], "tts_engine");
        assert_eq!(frames[0]["engine"], "gpu_fast");
        assert_eq!(frames[1]["type"], "error");
        assert_eq!(actor.state.tts_engine, TtsEngineId::GpuFast);
    }

    #[tokio::test]
    async fn clear_history_emits_ack() {
        let (mut actor, mut out) = test_actor();
        actor.state.push_history(ConversationTurn::user("hi"));
        actor.handle_inbound(ClientEnvelope::ClearHistory).await;
        assert!(actor.state.history.is_empty());
        let frames = drain(&mut out);
        assert_eq!(frames[0]["type"], "history_cleared");
    }
}
