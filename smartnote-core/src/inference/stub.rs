//! Stub backends that produce deterministic output without model files.
//!
//! They let the host run every command end-to-end on a machine with no
//! weights downloaded.

use std::ops::ControlFlow;
use std::path::Path;
use std::time::Duration;

use tracing::debug;

use crate::error::{Result, SmartNoteError};
use crate::inference::{GenerationParams, LanguageModel, Transcriber};

/// Language model that answers every prompt with a fixed SmartNote outline.
///
/// The `Motif` line records the prompt length so callers can tell calls
/// apart. An optional per-call latency simulates a slow model.
#[derive(Debug, Default)]
pub struct StubLanguageModel {
    latency: Duration,
    calls: u64,
}

impl StubLanguageModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(latency: Duration) -> Self {
        Self { latency, calls: 0 }
    }

    pub fn calls(&self) -> u64 {
        self.calls
    }

    fn respond(&mut self, prompt: &str) -> String {
        self.calls += 1;
        if !self.latency.is_zero() {
            std::thread::sleep(self.latency);
        }
        format!(
            "- Motif : [stub: {} chars]\n- Plan : a preciser\n- Prochain RDV : a planifier",
            prompt.chars().count()
        )
    }
}

impl LanguageModel for StubLanguageModel {
    fn warm_up(&mut self) -> Result<()> {
        debug!("StubLanguageModel::warm_up, no-op");
        Ok(())
    }

    fn generate(&mut self, prompt: &str, params: &GenerationParams) -> Result<String> {
        debug!(max_tokens = params.max_tokens, "stub generate");
        Ok(self.respond(prompt))
    }

    fn generate_stream(
        &mut self,
        prompt: &str,
        _params: &GenerationParams,
        on_fragment: &mut dyn FnMut(&str) -> ControlFlow<()>,
    ) -> Result<()> {
        let text = self.respond(prompt);
        for piece in text.split_inclusive([' ', '\n']) {
            if on_fragment(piece).is_break() {
                debug!("stub stream stopped by consumer");
                break;
            }
        }
        Ok(())
    }
}

/// Transcriber that reads the WAV header and reports its shape.
#[derive(Debug, Default)]
pub struct StubTranscriber;

impl StubTranscriber {
    pub fn new() -> Self {
        Self
    }
}

impl Transcriber for StubTranscriber {
    fn transcribe(&mut self, audio_path: &Path, language: &str) -> Result<String> {
        let reader = hound::WavReader::open(audio_path).map_err(|e| {
            SmartNoteError::Transcription(format!("{}: {e}", audio_path.display()))
        })?;
        let spec = reader.spec();
        let frames = reader.duration();
        debug!(
            path = %audio_path.display(),
            language,
            channels = spec.channels,
            "stub transcribe"
        );
        Ok(format!("[stub: {} samples @ {} Hz]", frames, spec.sample_rate))
    }
}
