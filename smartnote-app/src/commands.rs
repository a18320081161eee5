//! Command handlers.
//!
//! Each handler applies the rate limiter for its route, calls the engine and
//! maps failures to `CommandError`. Successful responses carry the limiter
//! headers so a transport can forward them unchanged.

use std::path::Path;
use std::sync::{atomic::Ordering, Arc};
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use smartnote_core::summarize::{NoteSection, SummaryStrategy};
use smartnote_core::{
    CancellationFlag, GateStatus, SmartNote, SmartNoteError, TokenStream,
};
use tracing::{debug, info};

use crate::errors::{
    new_request_id, CommandError, INPUT_EMPTY_TEXT, INPUT_TOO_LARGE, INPUT_UNSUPPORTED_EXT,
    MODEL_WHISPER_NOT_FOUND,
};
use crate::sanitize::sanitize_input;
use crate::state::{AppState, CommandKind, PerfMetrics, StatusReport};

pub const ROUTE_SUMMARIZE: &str = "/summarize";
pub const ROUTE_SUMMARIZE_RAG: &str = "/summarize-rag";
pub const ROUTE_SUMMARIZE_STREAM: &str = "/summarize-stream";
pub const ROUTE_SUMMARIZE_STREAM_RAG: &str = "/summarize-stream-rag";
pub const ROUTE_TRANSCRIBE: &str = "/transcribe";
pub const ROUTE_WORKERS_STATUS: &str = "/workers/status";
pub const ROUTE_LLM_STATUS: &str = "/llm/status";

pub const ALLOWED_AUDIO_EXTENSIONS: &[&str] = &["m4a", "mp3", "mp4", "ogg", "wav", "webm"];
pub const MAX_AUDIO_BYTES: u64 = 100 * 1024 * 1024;

const DONE_FRAME: &str = "data: [DONE]\n\n";

type Headers = Vec<(&'static str, String)>;

/// A successful command result plus the headers to send with it.
#[derive(Debug)]
pub struct CommandOutput<T> {
    pub body: T,
    pub headers: Headers,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummaryResponse {
    pub summary: String,
    pub sections: Vec<NoteSection>,
    pub strategy: SummaryStrategy,
    pub chunks: usize,
}

impl From<SmartNote> for SummaryResponse {
    fn from(note: SmartNote) -> Self {
        Self {
            summary: note.text,
            sections: note.sections,
            strategy: note.strategy,
            chunks: note.chunks,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptionResponse {
    pub text: String,
    pub request_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LlmStatusResponse {
    pub available: bool,
    #[serde(flatten)]
    pub gate: GateStatus,
}

/// Generate a complete SmartNote.
pub async fn summarize(
    state: &AppState,
    client: &str,
    text: &str,
    cancel: &CancellationFlag,
) -> Result<CommandOutput<SummaryResponse>, CommandError> {
    let headers = admit(state, client, "POST", ROUTE_SUMMARIZE)?;
    let transcript = require_text(text)?;

    let started = Instant::now();
    let note = state.engine.summarize(&transcript, cancel).await;
    state.record_latency(CommandKind::Summarize, elapsed_ms(started));

    Ok(CommandOutput {
        body: note?.into(),
        headers,
    })
}

/// Generate a SmartNote grounded by retrieved references.
pub async fn summarize_rag(
    state: &AppState,
    client: &str,
    text: &str,
    cancel: &CancellationFlag,
) -> Result<CommandOutput<SummaryResponse>, CommandError> {
    let headers = admit(state, client, "POST", ROUTE_SUMMARIZE_RAG)?;
    let transcript = require_text(text)?;

    let started = Instant::now();
    let note = state.engine.summarize_rag(&transcript, cancel).await;
    state.record_latency(CommandKind::SummarizeRag, elapsed_ms(started));

    Ok(CommandOutput {
        body: note?.into(),
        headers,
    })
}

/// Start a streamed SmartNote. Admission happens before this returns, so a
/// busy gate is reported as an error rather than as a stream frame.
pub async fn summarize_stream(
    state: &AppState,
    client: &str,
    text: &str,
    with_context: bool,
    cancel: CancellationFlag,
) -> Result<CommandOutput<SseStream>, CommandError> {
    let route = if with_context {
        ROUTE_SUMMARIZE_STREAM_RAG
    } else {
        ROUTE_SUMMARIZE_STREAM
    };
    let mut headers = admit(state, client, "POST", route)?;
    let transcript = require_text(text)?;

    let started = Instant::now();
    let tokens = state
        .engine
        .summarize_stream(&transcript, with_context, cancel)
        .await?;
    debug!(route, "stream opened");

    headers.extend([
        ("Content-Type", "text/event-stream".to_string()),
        ("Cache-Control", "no-cache".to_string()),
        ("Connection", "keep-alive".to_string()),
        ("X-Accel-Buffering", "no".to_string()),
    ]);
    Ok(CommandOutput {
        body: SseStream {
            tokens,
            perf: Arc::clone(&state.perf_metrics),
            started,
            finished: false,
        },
        headers,
    })
}

/// Server-sent event frames for a streamed SmartNote.
///
/// Yields `data: {"chunk": ...}` per fragment, then exactly one terminal
/// frame: `data: [DONE]` or `data: {"error": ...}`. Dropping the stream stops
/// generation.
pub struct SseStream {
    tokens: TokenStream,
    perf: Arc<Mutex<PerfMetrics>>,
    started: Instant,
    finished: bool,
}

impl SseStream {
    pub async fn next_frame(&mut self) -> Option<String> {
        if self.finished {
            return None;
        }
        match self.tokens.next().await {
            Some(Ok(chunk)) => Some(data_frame(&json!({ "chunk": chunk }))),
            Some(Err(e)) => {
                self.finish();
                let err = CommandError::stream(e);
                Some(data_frame(&json!({
                    "error": err.detail.as_deref().unwrap_or(err.message),
                    "error_code": err.error_code,
                    "request_id": err.request_id,
                })))
            }
            None => {
                self.finish();
                Some(DONE_FRAME.to_string())
            }
        }
    }

    fn finish(&mut self) {
        self.finished = true;
        self.perf
            .lock()
            .record(CommandKind::SummarizeStream, elapsed_ms(self.started));
    }
}

fn data_frame(payload: &serde_json::Value) -> String {
    format!("data: {payload}\n\n")
}

/// Transcribe an audio file on the transcription pool.
pub async fn transcribe(
    state: &AppState,
    client: &str,
    audio_path: &Path,
    language: Option<&str>,
    cancel: &CancellationFlag,
) -> Result<CommandOutput<TranscriptionResponse>, CommandError> {
    let headers = admit(state, client, "POST", ROUTE_TRANSCRIBE)?;
    validate_audio(audio_path)?;
    if cancel.is_cancelled() {
        return Err(SmartNoteError::Cancelled.into());
    }

    let started = Instant::now();
    let result = state
        .engine
        .transcribe(audio_path.to_path_buf(), language)
        .await;
    state.record_latency(CommandKind::Transcribe, elapsed_ms(started));

    let text = result.map_err(|e| match e {
        SmartNoteError::ModelUnavailable(detail) => {
            CommandError::new(MODEL_WHISPER_NOT_FOUND, Some(detail))
        }
        other => other.into(),
    })?;
    let request_id = new_request_id();
    info!(request_id = %request_id, chars = text.len(), "transcription complete");
    Ok(CommandOutput {
        body: TranscriptionResponse { text, request_id },
        headers,
    })
}

/// Worker pools, the inference gate and host latency windows.
pub async fn workers_status(
    state: &AppState,
    client: &str,
) -> Result<CommandOutput<StatusReport>, CommandError> {
    let headers = admit(state, client, "GET", ROUTE_WORKERS_STATUS)?;
    Ok(CommandOutput {
        body: state.status_report(),
        headers,
    })
}

/// Inference gate occupancy and model availability.
pub async fn llm_status(
    state: &AppState,
    client: &str,
) -> Result<CommandOutput<LlmStatusResponse>, CommandError> {
    let headers = admit(state, client, "GET", ROUTE_LLM_STATUS)?;
    Ok(CommandOutput {
        body: LlmStatusResponse {
            available: state.engine.llm().is_available(),
            gate: state.engine.gate().status(),
        },
        headers,
    })
}

fn admit(state: &AppState, client: &str, method: &str, path: &str) -> Result<Headers, CommandError> {
    let Some(decision) = state.limiter.check(client, method, path)? else {
        return Ok(Vec::new());
    };
    let headers = decision.headers();
    match decision.into_result() {
        Ok(_) => Ok(headers),
        Err(e) => {
            state.rate_limited.fetch_add(1, Ordering::Relaxed);
            Err(CommandError::from(e).with_headers(headers))
        }
    }
}

fn require_text(raw: &str) -> Result<String, CommandError> {
    let text = sanitize_input(raw);
    if text.is_empty() {
        return Err(CommandError::new(INPUT_EMPTY_TEXT, None));
    }
    Ok(text)
}

fn validate_audio(path: &Path) -> Result<(), CommandError> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    if !ALLOWED_AUDIO_EXTENSIONS.contains(&ext.as_str()) {
        let allowed: Vec<String> = ALLOWED_AUDIO_EXTENSIONS
            .iter()
            .map(|e| format!(".{e}"))
            .collect();
        return Err(CommandError::new(
            INPUT_UNSUPPORTED_EXT,
            Some(format!("Allowed: {}", allowed.join(", "))),
        ));
    }
    let size = std::fs::metadata(path).map_err(SmartNoteError::Io)?.len();
    if size > MAX_AUDIO_BYTES {
        return Err(CommandError::new(
            INPUT_TOO_LARGE,
            Some(format!("{size} bytes exceeds {MAX_AUDIO_BYTES}")),
        ));
    }
    Ok(())
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}
