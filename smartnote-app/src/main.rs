//! SmartNote backend host.
//!
//! Loads the persisted settings, exports them to the environment, builds the
//! engine and rate limiter, then runs one command and prints its JSON result.
//!
//! ```text
//! smartnote status
//! smartnote llm-status
//! smartnote settings
//! smartnote summarize <transcript.txt> [--rag]
//! smartnote stream <transcript.txt> [--rag]
//! smartnote transcribe <audio.wav> [language]
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all)]

mod commands;
mod errors;
mod sanitize;
mod settings;
mod state;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use settings::{
    apply_runtime_env_from_settings, default_data_dir, default_settings_path, load_settings,
    save_settings,
};
use smartnote_core::{
    inference::{StubLanguageModel, StubTranscriber},
    Backend, BackendConfig, CancellationFlag, EngineBackends, ModelHandle, SmartNoteEngine,
    SmartNoteError, TranscriberHandle,
};
use state::AppState;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use crate::commands::CommandOutput;
use crate::errors::CommandError;

/// Commands issued from the command line count as one local client.
const LOCAL_CLIENT: &str = "127.0.0.1";

const USAGE: &str = "usage: smartnote <status | llm-status | settings | summarize FILE [--rag] | stream FILE [--rag] | transcribe AUDIO [LANGUAGE]>";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Status,
    LlmStatus,
    Settings,
    Summarize { file: PathBuf, rag: bool },
    Stream { file: PathBuf, rag: bool },
    Transcribe { file: PathBuf, language: Option<String> },
}

impl Command {
    fn parse(args: &[String]) -> Option<Self> {
        let (name, rest) = args.split_first()?;
        let rag = rest.iter().any(|a| a == "--rag");
        let mut positional = rest.iter().filter(|a| !a.starts_with("--"));
        let file = positional.next().map(PathBuf::from);
        match name.as_str() {
            "status" => Some(Self::Status),
            "llm-status" => Some(Self::LlmStatus),
            "settings" => Some(Self::Settings),
            "summarize" => Some(Self::Summarize { file: file?, rag }),
            "stream" => Some(Self::Stream { file: file?, rag }),
            "transcribe" => Some(Self::Transcribe {
                file: file?,
                language: positional.next().cloned(),
            }),
            _ => None,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("smartnote=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = Command::parse(&args) else {
        eprintln!("{USAGE}");
        std::process::exit(2);
    };

    let data_dir = default_data_dir();
    let settings_path = default_settings_path();
    let settings = load_settings(&settings_path);
    if !settings_path.exists() {
        if let Err(e) = save_settings(&settings_path, &settings) {
            warn!(path = %settings_path.display(), error = %e, "could not write default settings");
        }
    }
    apply_runtime_env_from_settings(&settings, &data_dir);

    let config = BackendConfig::from_env();
    let limiter = Arc::new(config.build_rate_limiter()?);
    // No model files ship with the host; the stubs keep every command path live.
    let backends = EngineBackends {
        llm: Backend::Ready(ModelHandle::new(StubLanguageModel::new())),
        transcriber: Backend::Ready(TranscriberHandle::new(StubTranscriber::new())),
        retriever: None,
    };
    let engine = Arc::new(SmartNoteEngine::new(config, backends)?);
    engine.warm_up().await?;

    let state = AppState::new(Arc::clone(&engine), limiter, settings, settings_path);
    info!(
        data_dir = %data_dir.display(),
        rate_limiting = state.limiter.is_enabled(),
        "smartnote host ready"
    );

    let cancel = CancellationFlag::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, cancelling request");
                cancel.cancel();
            }
        });
    }

    let outcome = run(&state, command, cancel).await;
    engine.shutdown();

    if let Err(err) = outcome {
        log_headers(&err.headers);
        eprintln!("{}", serde_json::to_string_pretty(&err)?);
        std::process::exit(1);
    }
    Ok(())
}

async fn run(state: &AppState, command: Command, cancel: CancellationFlag) -> Result<(), CommandError> {
    match command {
        Command::Status => print_output(commands::workers_status(state, LOCAL_CLIENT).await?),
        Command::LlmStatus => print_output(commands::llm_status(state, LOCAL_CLIENT).await?),
        Command::Settings => print_json(&serde_json::json!({
            "path": state.settings_path.display().to_string(),
            "settings": state.settings.lock().clone(),
        })),
        Command::Summarize { file, rag } => {
            let text = read_transcript(&file)?;
            let out = if rag {
                commands::summarize_rag(state, LOCAL_CLIENT, &text, &cancel).await?
            } else {
                commands::summarize(state, LOCAL_CLIENT, &text, &cancel).await?
            };
            print_output(out)
        }
        Command::Stream { file, rag } => {
            let text = read_transcript(&file)?;
            let out = commands::summarize_stream(state, LOCAL_CLIENT, &text, rag, cancel).await?;
            log_headers(&out.headers);
            let mut stream = out.body;
            let mut stdout = std::io::stdout();
            while let Some(frame) = stream.next_frame().await {
                write!(stdout, "{frame}")
                    .and_then(|_| stdout.flush())
                    .map_err(SmartNoteError::Io)?;
            }
            Ok(())
        }
        Command::Transcribe { file, language } => print_output(
            commands::transcribe(state, LOCAL_CLIENT, &file, language.as_deref(), &cancel).await?,
        ),
    }
}

fn read_transcript(path: &Path) -> Result<String, CommandError> {
    std::fs::read_to_string(path).map_err(|e| SmartNoteError::Io(e).into())
}

/// Headers have no transport here, so they go to the log.
fn log_headers(headers: &[(&'static str, String)]) {
    for (name, value) in headers {
        debug!(header = *name, %value, "response header");
    }
}

fn print_output<T: Serialize>(out: CommandOutput<T>) -> Result<(), CommandError> {
    log_headers(&out.headers);
    print_json(&out.body)
}

fn print_json<T: Serialize>(value: &T) -> Result<(), CommandError> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| SmartNoteError::Other(anyhow::Error::new(e)))?;
    println!("{json}");
    Ok(())
}
