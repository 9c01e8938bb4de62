//! Pipeline orchestrator
//!
//! One logical operation: fulfil a user turn. Input arrives as audio,
//! text, or multimodal content; the canonical path streams the LLM reply,
//! splits it into sentences, emits reply chunks synchronously and audio
//! chunks from concurrent TTS tasks, then extracts artifacts and buttons
//! and signals completion. Exactly one run is active per session; the
//! session actor owns start, cancel, and history commit.

pub mod prompt;
pub mod search_intent;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::ambient;
use crate::audio;
use crate::media;
use crate::protocol::{emotion, sentence, tags, Emotion, PipelineState, ServerEnvelope};
use crate::services::llm::{ChatContent, ContentPart, LlmEvent};
use crate::services::tts::TtsEngineId;
use crate::services::Services;
use crate::session::SessionMsg;
use crate::types::ConversationTurn;

/// Input flavour for a single run
#[derive(Debug)]
pub enum RunInput {
    Text {
        text: String,
        prefix: Option<String>,
        /// Ambient-initiated input skips search injection when wrapped
        ambient: bool,
    },
    Audio {
        pcm: Vec<u8>,
        prefix: Option<String>,
    },
    Image {
        data: Vec<u8>,
        mime: String,
        caption: Option<String>,
    },
    File {
        data: Vec<u8>,
        name: String,
    },
}

/// Everything a run needs from its session, snapshotted at start
pub struct RunContext {
    pub run_id: u64,
    pub session_tx: mpsc::UnboundedSender<SessionMsg>,
    pub cancel: watch::Receiver<bool>,
    pub services: Arc<Services>,
    pub history: Vec<ConversationTurn>,
    pub tts_engine: TtsEngineId,
}

/// What the session actor commits when the run ends
#[derive(Debug, Default)]
pub struct RunOutcome {
    /// User turn to record (textual summary for multimodal input)
    pub user_text: Option<String>,
    /// Emotion-stripped concatenation of emitted chunks
    pub assistant_text: String,
    pub cancelled: bool,
    pub errored: bool,
}

impl RunOutcome {
    fn aborted_before_commit() -> Self {
        Self::default()
    }
}

fn emit(ctx: &RunContext, envelope: ServerEnvelope) {
    let _ = ctx
        .session_tx
        .send(SessionMsg::Emit { run_id: Some(ctx.run_id), envelope });
}

fn is_cancelled(ctx: &RunContext) -> bool {
    *ctx.cancel.borrow()
}

/// Execute one run to completion.
///
/// Always finishes by notifying the session actor, which joins the task
/// and commits the outcome at a single point.
pub async fn run_pipeline(mut ctx: RunContext, input: RunInput) -> RunOutcome {
    let outcome = drive(&mut ctx, input).await;
    let _ = ctx.session_tx.send(SessionMsg::RunFinished { run_id: ctx.run_id });
    outcome
}

async fn drive(ctx: &mut RunContext, input: RunInput) -> RunOutcome {
    let (content, display, searchable, ambient, prefix) = match resolve_input(ctx, input).await {
        Ok(Some(resolved)) => resolved,
        Ok(None) => {
            // Cancelled before any content was assembled
            emit(ctx, ServerEnvelope::Status { state: PipelineState::Idle });
            let mut outcome = RunOutcome::aborted_before_commit();
            outcome.cancelled = true;
            return outcome;
        }
        Err(message) => {
            emit(ctx, ServerEnvelope::Error { message });
            emit(ctx, ServerEnvelope::Status { state: PipelineState::Idle });
            let mut outcome = RunOutcome::aborted_before_commit();
            outcome.errored = true;
            return outcome;
        }
    };

    emit(ctx, ServerEnvelope::Status { state: PipelineState::Thinking });

    // Heuristic search injection on the raw utterance
    let content = match &searchable {
        Some(raw) if !ambient && !raw.starts_with(ambient::AMBIENT_MARKER) => {
            inject_search(ctx, content, raw).await
        }
        _ => content,
    };

    if is_cancelled(ctx) {
        emit(ctx, ServerEnvelope::Status { state: PipelineState::Idle });
        let mut outcome = RunOutcome::aborted_before_commit();
        outcome.cancelled = true;
        return outcome;
    }

    // First attempt, then one retry with the prefix stripped on an empty
    // direct-text response.
    let mut stream_result = stream_reply(ctx, content.clone()).await;
    let direct_text = !ambient;
    if stream_result.chunks.is_empty()
        && !stream_result.cancelled
        && !stream_result.errored
        && direct_text
    {
        let retry_content = match (&content, &prefix) {
            (ChatContent::Text(t), Some(p)) => {
                let stripped = t.strip_prefix(p.as_str()).unwrap_or(t).trim_start();
                ChatContent::Text(stripped.to_string())
            }
            _ => content.clone(),
        };
        info!("Empty response, retrying once without prefix");
        stream_result = stream_reply(ctx, retry_content).await;
    }

    let assistant_text = stream_result.chunks.join(" ").trim().to_string();
    if !assistant_text.is_empty() {
        debug!("Assistant reply ({} chunks): \"{}\"",
            stream_result.chunks.len(), crate::truncate_safe(&assistant_text, 100));
    }

    if stream_result.cancelled {
        emit(ctx, ServerEnvelope::Status { state: PipelineState::Idle });
        return RunOutcome {
            user_text: Some(display),
            assistant_text,
            cancelled: true,
            errored: false,
        };
    }

    if !stream_result.errored {
        extract_and_emit(ctx, &stream_result.raw);
    }

    emit(ctx, ServerEnvelope::StreamDone);
    emit(ctx, ServerEnvelope::Status { state: PipelineState::Idle });

    RunOutcome {
        user_text: Some(display),
        assistant_text,
        cancelled: false,
        errored: stream_result.errored,
    }
}

type ResolvedInput = (ChatContent, String, Option<String>, bool, Option<String>);

/// Normalize the four input flavours into LLM content.
///
/// Returns `Ok(None)` when the run ends early without anything to commit
/// (cancelled mid-transcription, or garbage audio already reported).
async fn resolve_input(ctx: &mut RunContext, input: RunInput) -> Result<Option<ResolvedInput>, String> {
    match input {
        RunInput::Text { text, prefix, ambient } => {
            let full = match &prefix {
                Some(p) => format!("{} {}", p, text).trim().to_string(),
                None => text.clone(),
            };
            Ok(Some((
                ChatContent::Text(full.clone()),
                full.clone(),
                Some(text),
                ambient,
                prefix,
            )))
        }
        RunInput::Audio { pcm, prefix } => {
            emit(ctx, ServerEnvelope::Status { state: PipelineState::Transcribing });

            let transcript = tokio::select! {
                biased;
                _ = ctx.cancel.changed() => return Ok(None),
                result = ctx.services.asr.transcribe(&pcm, audio::MIC_SAMPLE_RATE) => result,
            };

            let transcript = match transcript {
                Ok(t) => t,
                Err(e) => {
                    warn!("Transcription failed: {:#}", e);
                    return Err("Transcription failed, please try again".to_string());
                }
            };

            if transcript.text.is_empty() || crate::services::asr::is_garbage(&transcript.text) {
                return Err("I didn't catch that. Could you speak again?".to_string());
            }

            emit(ctx, ServerEnvelope::Transcript { text: transcript.text.clone() });

            let full = match &prefix {
                Some(p) => format!("{} {}", p, transcript.text).trim().to_string(),
                None => transcript.text.clone(),
            };
            Ok(Some((
                ChatContent::Text(full.clone()),
                full,
                Some(transcript.text),
                false,
                prefix,
            )))
        }
        RunInput::Image { data, mime, caption } => {
            let uri = media::image_data_uri(&data, &mime).map_err(|e| e.to_string())?;
            let mut parts = Vec::new();
            let caption_text = caption.clone().unwrap_or_default();
            if !caption_text.is_empty() {
                parts.push(ContentPart::text(caption_text.clone()));
            }
            parts.push(ContentPart::image(uri));
            let display = media::placeholder_summary("image", &caption_text);
            Ok(Some((ChatContent::Parts(parts), display, caption, false, None)))
        }
        RunInput::File { data, name } => {
            let embedded = media::embed_file(&data, &name).map_err(|e| e.to_string())?;
            let display = media::placeholder_summary("file", &name);
            Ok(Some((ChatContent::Text(embedded), display, None, false, None)))
        }
    }
}

async fn inject_search(ctx: &mut RunContext, content: ChatContent, raw: &str) -> ChatContent {
    if !search_intent::detect(raw) {
        return content;
    }
    let Some(query) = search_intent::extract_query(raw) else {
        return content;
    };

    let results = tokio::select! {
        biased;
        _ = ctx.cancel.changed() => return content,
        result = ctx.services.search.search(&query) => result,
    };

    match (results, content) {
        (Ok(results), ChatContent::Text(text)) => {
            debug!("Injecting {} search results", results.len());
            ChatContent::Text(search_intent::inject_results(&text, &query, &results))
        }
        (Err(e), content) => {
            debug!("Search adapter unavailable, skipping injection: {:#}", e);
            content
        }
        (_, content) => content,
    }
}

/// Result of one streaming attempt
struct StreamResult {
    /// Cleaned chunk texts in emission order
    chunks: Vec<String>,
    /// Raw accumulated stream text (tags intact) for extraction
    raw: String,
    cancelled: bool,
    errored: bool,
}

async fn stream_reply(ctx: &mut RunContext, content: ChatContent) -> StreamResult {
    let messages = prompt::build_messages(&ctx.history, content);
    let mut stream = ctx.services.llm.stream_chat(messages);

    let mut buffer = String::new();
    let mut raw = String::new();
    let mut chunks: Vec<String> = Vec::new();
    let mut tts_tasks: Vec<tokio::task::JoinHandle<()>> = Vec::new();
    let mut cancelled = false;
    let mut errored = false;

    loop {
        tokio::select! {
            biased;
            changed = ctx.cancel.changed() => {
                if changed.is_err() || *ctx.cancel.borrow() {
                    cancelled = true;
                    break;
                }
            }
            event = stream.events.recv() => match event {
                Some(LlmEvent::Delta(delta)) => {
                    raw.push_str(&delta);
                    let split = sentence::push_delta(&buffer, &delta);
                    buffer = split.rest;
                    for s in split.sentences {
                        emit_sentence(ctx, &s, &mut chunks, &mut tts_tasks);
                    }
                }
                Some(LlmEvent::Error(message)) => {
                    // Flush what accumulated, then surface the error in-band
                    if let Some(tail) = sentence::flush(&buffer) {
                        emit_sentence(ctx, &tail, &mut chunks, &mut tts_tasks);
                    }
                    buffer.clear();
                    emit(ctx, ServerEnvelope::Error { message });
                    errored = true;
                    break;
                }
                Some(LlmEvent::Done) | None => {
                    if let Some(tail) = sentence::flush(&buffer) {
                        emit_sentence(ctx, &tail, &mut chunks, &mut tts_tasks);
                    }
                    buffer.clear();
                    break;
                }
            }
        }
    }

    if cancelled {
        stream.abort();
        for task in &tts_tasks {
            task.abort();
        }
    } else {
        // Completion: let every outstanding synthesis settle, staying
        // responsive to a late cancel
        for task in &mut tts_tasks {
            tokio::select! {
                biased;
                changed = ctx.cancel.changed() => {
                    if changed.is_err() || *ctx.cancel.borrow() {
                        cancelled = true;
                    }
                }
                result = task => {
                    let _ = result;
                }
            }
            if cancelled {
                break;
            }
        }
        if cancelled {
            for task in &tts_tasks {
                task.abort();
            }
        }
    }

    StreamResult { chunks, raw, cancelled, errored }
}

/// Emit one sentence: reply chunk synchronously, audio chunk from a
/// concurrent TTS task.
fn emit_sentence(
    ctx: &RunContext,
    raw_sentence: &str,
    chunks: &mut Vec<String>,
    tts_tasks: &mut Vec<tokio::task::JoinHandle<()>>,
) {
    let (tagged, clean) = emotion::parse_and_strip(raw_sentence);

    // Tag-only fragments (a trailing buttons tag, stray emotion tags)
    // produce no spoken chunk
    let (buttons, without_buttons) = tags::extract_buttons(&clean);
    let clean = if buttons.is_empty() { clean } else { without_buttons };
    if clean.is_empty() {
        return;
    }

    let emotion = tagged.unwrap_or_else(|| emotion::infer(&clean));
    let index = chunks.len();

    if index == 0 {
        emit(ctx, ServerEnvelope::Status { state: PipelineState::Speaking });
        emit(ctx, ServerEnvelope::Emotion { emotion });
    }

    emit(ctx, ServerEnvelope::ReplyChunk { text: clean.clone(), index, emotion });
    chunks.push(clean.clone());

    tts_tasks.push(spawn_tts(ctx, index, emotion, clean));
}

fn spawn_tts(
    ctx: &RunContext,
    index: usize,
    emotion: Emotion,
    text: String,
) -> tokio::task::JoinHandle<()> {
    let services = ctx.services.clone();
    let engine = ctx.tts_engine;
    let session_tx = ctx.session_tx.clone();
    let run_id = ctx.run_id;

    tokio::spawn(async move {
        match services.tts.synthesize(engine, &text).await {
            Ok(bytes) if !bytes.is_empty() => {
                let _ = session_tx.send(SessionMsg::Emit {
                    run_id: Some(run_id),
                    envelope: ServerEnvelope::AudioChunk {
                        data: BASE64.encode(&bytes),
                        index,
                        emotion,
                        text,
                    },
                });
            }
            Ok(_) => {}
            Err(e) => {
                // A failed synthesis degrades that sentence silently
                warn!("TTS failed for sentence {}: {:#}", index, e);
            }
        }
    })
}

/// Post-stream extraction of artifacts and buttons.
fn extract_and_emit(ctx: &RunContext, raw: &str) {
    let (artifacts, rest) = tags::extract_artifacts(raw);
    for artifact in artifacts {
        emit(ctx, ServerEnvelope::Artifact {
            artifact_type: "code".to_string(),
            content: artifact.content,
            language: artifact.language,
            title: artifact.title,
        });
    }

    let (buttons, _) = tags::extract_buttons(rest.trim_end());
    if !buttons.is_empty() {
        emit(ctx, ServerEnvelope::Buttons { options: buttons });
    }
}
