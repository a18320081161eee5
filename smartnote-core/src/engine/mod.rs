//! `SmartNoteEngine`: the one owner of every admission primitive.
//!
//! ## Routing
//!
//! ```text
//! summarize / summarize_rag / summarize_stream ─► InferenceGate ─► LanguageModel
//! transcribe ─────────────────────────────────► pool "whisper" ─► Transcriber
//! retrieve (and the RAG step of summarize_rag) ─► pool "rag"     ─► Retriever
//! ```
//!
//! Built once by the host and shared behind an `Arc`. All methods take
//! `&self`; the primitives inside synchronise themselves.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use crate::{
    admission::{CancellationFlag, InferenceGate, Priority},
    config::{BackendConfig, RAG_POOL, WHISPER_POOL},
    error::{Result, SmartNoteError},
    inference::{
        format_context, Backend, ContextSnippet, LocalLlm, ModelHandle, RetrieverHandle,
        TokenStream, TranscriberHandle,
    },
    pool::WorkerPools,
    status::SystemStatus,
    summarize::{prompts, SmartNote, Summarizer},
};

/// Model backends resolved by the host at startup.
#[derive(Debug, Clone)]
pub struct EngineBackends {
    pub llm: Backend<ModelHandle>,
    pub transcriber: Backend<TranscriberHandle>,
    /// `None` disables retrieval; RAG summaries then use no context.
    pub retriever: Option<RetrieverHandle>,
}

pub struct SmartNoteEngine {
    config: BackendConfig,
    llm: Arc<LocalLlm>,
    summarizer: Summarizer,
    pools: WorkerPools,
    transcriber: Backend<TranscriberHandle>,
    retriever: Option<RetrieverHandle>,
    shut_down: AtomicBool,
}

impl SmartNoteEngine {
    /// Build the gate and pools described by `config`.
    ///
    /// # Errors
    /// Fails if pool threads cannot be spawned.
    pub fn new(config: BackendConfig, backends: EngineBackends) -> Result<Self> {
        let pools = WorkerPools::new(config.pool_configs())?;

        let gate = InferenceGate::new(config.llm_max_concurrency);
        let llm = Arc::new(LocalLlm::new(
            backends.llm,
            gate,
            config.generation.clone(),
            config.llm_queue_timeout,
        ));
        let summarizer = Summarizer::new(Arc::clone(&llm), config.chunking);

        info!(
            llm_slots = config.llm_max_concurrency,
            llm_available = llm.is_available(),
            transcriber_available = backends.transcriber.is_ready(),
            retrieval = backends.retriever.is_some(),
            "engine constructed"
        );

        Ok(Self {
            config,
            llm,
            summarizer,
            pools,
            transcriber: backends.transcriber,
            retriever: backends.retriever,
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    pub fn llm(&self) -> &LocalLlm {
        &self.llm
    }

    pub fn gate(&self) -> &InferenceGate {
        self.llm.gate()
    }

    pub fn pools(&self) -> &WorkerPools {
        &self.pools
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(SmartNoteError::Other(anyhow::anyhow!("engine is shut down")));
        }
        Ok(())
    }

    /// Warm the language model if one is loaded. A missing model is not an
    /// error here; requests that need it fail with `ModelUnavailable`.
    pub async fn warm_up(&self) -> Result<()> {
        self.ensure_running()?;
        if !self.llm.is_available() {
            warn!("language model unavailable, skipping warm-up");
            return Ok(());
        }
        info!("warming up language model");
        self.llm.warm_up().await
    }

    /// One-shot SmartNote at interactive priority.
    pub async fn summarize(&self, transcript: &str, cancel: &CancellationFlag) -> Result<SmartNote> {
        self.ensure_running()?;
        self.summarizer
            .summarize(transcript, Priority::Interactive, cancel)
            .await
    }

    /// SmartNote grounded by retrieved references. Retrieval failures
    /// degrade to an ungrounded note.
    pub async fn summarize_rag(
        &self,
        transcript: &str,
        cancel: &CancellationFlag,
    ) -> Result<SmartNote> {
        self.ensure_running()?;
        if transcript.trim().is_empty() {
            return Err(SmartNoteError::InvalidInput("transcript is empty".into()));
        }
        let context = self.retrieve_context(transcript).await;
        self.summarizer
            .summarize_with_context(transcript, &context, Priority::Interactive, cancel)
            .await
    }

    /// Streamed SmartNote. Long transcripts are not chunked on this path.
    pub async fn summarize_stream(
        &self,
        transcript: &str,
        with_context: bool,
        cancel: CancellationFlag,
    ) -> Result<TokenStream> {
        self.ensure_running()?;
        let transcript = transcript.trim();
        if transcript.is_empty() {
            return Err(SmartNoteError::InvalidInput("transcript is empty".into()));
        }
        let prompt = if with_context {
            let context = self.retrieve_context(transcript).await;
            prompts::smartnote_with_context(transcript, &context)
        } else {
            prompts::smartnote(transcript)
        };
        self.llm
            .generate_stream(prompt, Priority::Interactive, cancel)
            .await
    }

    /// Transcribe an audio file on the `whisper` pool.
    pub async fn transcribe(&self, audio_path: PathBuf, language: Option<&str>) -> Result<String> {
        self.ensure_running()?;
        let transcriber = self.transcriber.get()?;
        let language = language
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .unwrap_or(&self.config.transcription_language)
            .to_string();

        let text = self
            .pools
            .run(
                WHISPER_POOL,
                move || {
                    transcriber
                        .0
                        .lock()
                        .transcribe(&audio_path, &language)
                        .map_err(|e| match e {
                            SmartNoteError::Transcription(_) => e,
                            other => SmartNoteError::Transcription(other.to_string()),
                        })
                },
                None,
            )
            .await?;
        Ok(text.trim().to_string())
    }

    /// Ranked snippets for `query` via the `rag` pool.
    ///
    /// # Errors
    /// `ModelUnavailable` when no retriever is configured.
    pub async fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<ContextSnippet>> {
        self.ensure_running()?;
        let retriever = self
            .retriever
            .clone()
            .ok_or_else(|| SmartNoteError::ModelUnavailable("retrieval is not configured".into()))?;
        let query = query.to_string();
        self.pools
            .run(RAG_POOL, move || retriever.retrieve(&query, top_k), None)
            .await
    }

    /// Retrieved context rendered for a prompt, or empty on any failure.
    pub async fn retrieve_context(&self, query: &str) -> String {
        if self.retriever.is_none() {
            return String::new();
        }
        match self.retrieve(query, self.config.rag_top_k).await {
            Ok(snippets) => format_context(&snippets),
            Err(e) => {
                warn!(error = %e, "retrieval failed, continuing without context");
                String::new()
            }
        }
    }

    /// Gate and pool snapshot.
    pub fn status(&self) -> SystemStatus {
        SystemStatus::new(self.pools.status(), self.llm.status())
    }

    /// Stop accepting work and release pool executors. In-flight work is not
    /// awaited. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.pools.shutdown();
        info!("engine shut down");
    }
}

impl std::fmt::Debug for SmartNoteEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmartNoteEngine")
            .field("llm", &self.llm)
            .field("pools", &self.pools)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::{Retriever, StubLanguageModel, StubTranscriber};

    struct FixedRetriever;

    impl Retriever for FixedRetriever {
        fn retrieve(&self, _query: &str, top_k: usize) -> Result<Vec<ContextSnippet>> {
            Ok(vec![ContextSnippet {
                source: "guide".into(),
                category: Some("paro".into()),
                content: "detartrage".into(),
                score: 1.0,
            }]
            .into_iter()
            .take(top_k)
            .collect())
        }
    }

    fn engine(retriever: Option<RetrieverHandle>) -> SmartNoteEngine {
        SmartNoteEngine::new(
            BackendConfig::default(),
            EngineBackends {
                llm: Backend::Ready(ModelHandle::new(StubLanguageModel::new())),
                transcriber: Backend::Ready(TranscriberHandle::new(StubTranscriber::new())),
                retriever,
            },
        )
        .expect("build engine")
    }

    #[tokio::test]
    async fn status_lists_pools_and_gate() {
        let engine = engine(None);
        let status = engine.status();
        assert!(status.pool(WHISPER_POOL).is_some());
        assert!(status.pool(RAG_POOL).is_some());
        assert_eq!(status.llm.gate.max_concurrency, 1);
        assert!(!status.any_busy());
    }

    #[tokio::test]
    async fn summarize_returns_structured_note() {
        let engine = engine(None);
        let note = engine
            .summarize("Patient avec douleur en 36.", &CancellationFlag::new())
            .await
            .expect("summarize");
        assert_eq!(note.section("Plan"), Some("a preciser"));
        assert_eq!(engine.status().llm.gate.running, 0);
    }

    #[tokio::test]
    async fn empty_transcript_is_invalid_input() {
        let engine = engine(None);
        let err = engine
            .summarize("   ", &CancellationFlag::new())
            .await
            .expect_err("empty");
        assert!(matches!(err, SmartNoteError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn retrieval_goes_through_rag_pool() {
        let engine = engine(Some(Arc::new(FixedRetriever)));
        let context = engine.retrieve_context("gencives").await;
        assert_eq!(context, "[guide - paro]\ndetartrage");
        assert_eq!(engine.status().pool(RAG_POOL).map(|p| p.total_processed), Some(1));
    }

    #[tokio::test]
    async fn missing_retriever_degrades_to_no_context() {
        let engine = engine(None);
        assert_eq!(engine.retrieve_context("q").await, "");
        assert!(matches!(
            engine.retrieve("q", 3).await,
            Err(SmartNoteError::ModelUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn missing_audio_counts_as_whisper_error() {
        let engine = engine(None);
        let err = engine
            .transcribe(PathBuf::from("/nonexistent/consult.wav"), None)
            .await
            .expect_err("missing file");
        assert!(matches!(err, SmartNoteError::Transcription(_)));
        let whisper = engine.status().pool(WHISPER_POOL).cloned().expect("whisper pool");
        assert_eq!(whisper.total_errors, 1);
        assert_eq!(whisper.running, 0);
    }

    #[tokio::test]
    async fn shutdown_rejects_further_requests() {
        let engine = engine(None);
        engine.shutdown();
        engine.shutdown();
        assert!(engine
            .summarize("texte", &CancellationFlag::new())
            .await
            .is_err());
    }
}
