//! `LocalLlm`: the language model behind the inference gate.
//!
//! Every generation first takes a gate slot, then runs on Tokio's blocking
//! pool with the permit moved into the blocking closure. The slot is
//! therefore held exactly as long as the model is busy, whether or not the
//! caller is still waiting for the answer.

use std::ops::ControlFlow;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::admission::{CancellationFlag, GateStatus, InferenceGate, Priority};
use crate::error::{Result, SmartNoteError};
use crate::inference::{Backend, GenerationParams, ModelHandle};

/// Fragments buffered between the generating thread and the consumer.
pub const STREAM_BUFFER: usize = 64;

pub struct LocalLlm {
    backend: Backend<ModelHandle>,
    gate: InferenceGate,
    params: GenerationParams,
    queue_timeout: Duration,
}

impl LocalLlm {
    pub fn new(
        backend: Backend<ModelHandle>,
        gate: InferenceGate,
        params: GenerationParams,
        queue_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            gate,
            params,
            queue_timeout,
        }
    }

    pub fn is_available(&self) -> bool {
        self.backend.is_ready()
    }

    pub fn gate(&self) -> &InferenceGate {
        &self.gate
    }

    pub fn status(&self) -> GateStatus {
        self.gate.status()
    }

    pub fn params(&self) -> &GenerationParams {
        &self.params
    }

    /// Run the model's warm-up under a gate slot.
    pub async fn warm_up(&self) -> Result<()> {
        let model = self.backend.get()?;
        let permit = self
            .gate
            .acquire(Priority::Batch, self.queue_timeout, &CancellationFlag::new())
            .await?;
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            model.0.lock().warm_up()
        })
        .await
        .map_err(|e| SmartNoteError::Inference(format!("warm-up task failed: {e}")))??;
        info!("language model warmed up");
        Ok(())
    }

    /// One-shot generation.
    ///
    /// # Errors
    /// `ModelUnavailable` before queueing; `Busy` or `Cancelled` from the
    /// gate; `Inference` if the model fails or returns nothing.
    pub async fn generate(
        &self,
        prompt: String,
        priority: Priority,
        cancel: &CancellationFlag,
    ) -> Result<String> {
        let model = self.backend.get()?;
        let permit = self.gate.acquire(priority, self.queue_timeout, cancel).await?;
        let params = self.params.clone();
        let prompt_chars = prompt.len();

        let raw = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            model.0.lock().generate(&prompt, &params)
        })
        .await
        .map_err(|e| SmartNoteError::Inference(format!("generation task failed: {e}")))??;

        let text = strip_stop_tokens(&raw, &self.params.stop);
        debug!(%priority, prompt_chars, output_chars = text.len(), "generation finished");
        if text.is_empty() {
            return Err(SmartNoteError::Inference("model returned empty output".into()));
        }
        Ok(text)
    }

    /// Streaming generation.
    ///
    /// Admission happens before this returns, so `Busy` surfaces here rather
    /// than mid-stream. The generating thread stops when `cancel` is set or
    /// the returned stream is dropped.
    pub async fn generate_stream(
        &self,
        prompt: String,
        priority: Priority,
        cancel: CancellationFlag,
    ) -> Result<TokenStream> {
        let model = self.backend.get()?;
        let permit = self.gate.acquire(priority, self.queue_timeout, &cancel).await?;
        let params = self.params.clone();
        let (tx, rx) = mpsc::channel::<Result<String>>(STREAM_BUFFER);

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let mut model = model.0.lock();
            let mut sent = 0usize;
            let outcome = model.generate_stream(&prompt, &params, &mut |fragment| {
                if cancel.is_cancelled() {
                    return ControlFlow::Break(());
                }
                let stop_at = find_stop(fragment, &params.stop);
                let text = &fragment[..stop_at.unwrap_or(fragment.len())];
                if !text.is_empty() {
                    if tx.blocking_send(Ok(text.to_string())).is_err() {
                        // Consumer went away.
                        return ControlFlow::Break(());
                    }
                    sent += 1;
                }
                match stop_at {
                    Some(_) => ControlFlow::Break(()),
                    None => ControlFlow::Continue(()),
                }
            });
            match outcome {
                Ok(()) if cancel.is_cancelled() => {
                    debug!(sent, "stream stopped by cancellation");
                }
                Ok(()) => debug!(sent, "stream finished"),
                Err(e) => {
                    warn!(error = %e, sent, "stream generation failed");
                    let _ = tx.blocking_send(Err(e));
                }
            }
        });

        Ok(TokenStream { rx })
    }
}

impl std::fmt::Debug for LocalLlm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalLlm")
            .field("available", &self.is_available())
            .field("gate", &self.gate)
            .field("queue_timeout", &self.queue_timeout)
            .finish()
    }
}

/// Fragments of an in-flight generation. Finite; ends when the producer
/// finishes, fails (one `Err` item), or is cancelled.
#[derive(Debug)]
pub struct TokenStream {
    rx: mpsc::Receiver<Result<String>>,
}

impl TokenStream {
    pub async fn next(&mut self) -> Option<Result<String>> {
        self.rx.recv().await
    }

    /// Drain the stream into one string, stopping at the first error.
    pub async fn collect_text(mut self) -> Result<String> {
        let mut out = String::new();
        while let Some(fragment) = self.next().await {
            out.push_str(&fragment?);
        }
        Ok(out)
    }
}

/// Cut at the first stop token and trim.
pub fn strip_stop_tokens(raw: &str, stop: &[String]) -> String {
    let end = find_stop(raw, stop).unwrap_or(raw.len());
    raw[..end].trim().to_string()
}

/// Byte offset of the earliest stop token in `text`.
fn find_stop(text: &str, stop: &[String]) -> Option<usize> {
    stop.iter()
        .filter(|s| !s.is_empty())
        .filter_map(|s| text.find(s.as_str()))
        .min()
}
