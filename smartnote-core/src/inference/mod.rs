//! Model abstractions.
//!
//! The engine never links a concrete inference runtime. It talks to three
//! traits, resolved once at startup:
//!
//! - [`LanguageModel`]: prompt in, text (or a fragment stream) out.
//! - [`Transcriber`]: audio file in, text out.
//! - [`Retriever`]: query in, ranked context snippets out.
//!
//! `&mut self` on the model traits expresses that decoders are stateful
//! (KV caches, sampler state). Mutation is serialised through the handles'
//! `parking_lot::Mutex`. A backend that could not be loaded is represented
//! by [`Backend::Unavailable`] so callers fail fast instead of queueing.

pub mod llm;
pub mod stub;

pub use llm::{LocalLlm, TokenStream};
pub use stub::{StubLanguageModel, StubTranscriber};

use std::ops::ControlFlow;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SmartNoteError};

/// Sampling parameters passed through to the language model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub repeat_penalty: f32,
    pub stop: Vec<String>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 800,
            temperature: 0.3,
            top_p: 0.9,
            top_k: 40,
            repeat_penalty: 1.1,
            stop: vec!["<|eot_id|>".to_string(), "<|end_of_text|>".to_string()],
        }
    }
}

/// Contract for text generation backends.
pub trait LanguageModel: Send + 'static {
    /// Load weights and run a throwaway generation. Called once at startup.
    ///
    /// # Errors
    /// Returns an error if model files are missing or corrupt.
    fn warm_up(&mut self) -> Result<()>;

    /// Generate a full completion for `prompt`.
    fn generate(&mut self, prompt: &str, params: &GenerationParams) -> Result<String>;

    /// Generate incrementally, passing each fragment to `on_fragment`.
    ///
    /// Implementations must stop as soon as `on_fragment` returns
    /// `ControlFlow::Break`; that is how a disconnected client or a set
    /// cancellation flag ends generation early.
    fn generate_stream(
        &mut self,
        prompt: &str,
        params: &GenerationParams,
        on_fragment: &mut dyn FnMut(&str) -> ControlFlow<()>,
    ) -> Result<()>;
}

/// Contract for speech-to-text backends.
pub trait Transcriber: Send + 'static {
    fn transcribe(&mut self, audio_path: &Path, language: &str) -> Result<String>;
}

/// One retrieved passage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSnippet {
    pub source: String,
    pub category: Option<String>,
    pub content: String,
    pub score: f32,
}

impl ContextSnippet {
    /// `[source]` or `[source - category]`, then the content on the next line.
    pub fn render(&self) -> String {
        match self.category.as_deref().filter(|c| !c.is_empty()) {
            Some(category) => format!("[{} - {}]\n{}", self.source, category, self.content),
            None => format!("[{}]\n{}", self.source, self.content),
        }
    }
}

/// Join snippets into one context block, separated by blank lines.
pub fn format_context(snippets: &[ContextSnippet]) -> String {
    snippets
        .iter()
        .map(ContextSnippet::render)
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Contract for retrieval over indexed knowledge. Implementations are
/// expected to be internally synchronised (a vector store handle).
pub trait Retriever: Send + Sync + 'static {
    /// Ranked snippets relevant to `query`, best first, at most `top_k`.
    fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<ContextSnippet>>;
}

/// Shared handle to a `LanguageModel`.
#[derive(Clone)]
pub struct ModelHandle(pub Arc<Mutex<dyn LanguageModel>>);

impl ModelHandle {
    pub fn new<M: LanguageModel>(model: M) -> Self {
        Self(Arc::new(Mutex::new(model)))
    }
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle").finish_non_exhaustive()
    }
}

/// Shared handle to a `Transcriber`.
#[derive(Clone)]
pub struct TranscriberHandle(pub Arc<Mutex<dyn Transcriber>>);

impl TranscriberHandle {
    pub fn new<T: Transcriber>(transcriber: T) -> Self {
        Self(Arc::new(Mutex::new(transcriber)))
    }
}

impl std::fmt::Debug for TranscriberHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranscriberHandle").finish_non_exhaustive()
    }
}

pub type RetrieverHandle = Arc<dyn Retriever>;

impl std::fmt::Debug for dyn Retriever {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Retriever")
    }
}

/// A backend resolved at startup: either usable, or known to be missing.
#[derive(Debug, Clone)]
pub enum Backend<H> {
    Ready(H),
    Unavailable(String),
}

impl<H: Clone> Backend<H> {
    /// # Errors
    /// `ModelUnavailable` carrying the recorded reason.
    pub fn get(&self) -> Result<H> {
        match self {
            Backend::Ready(handle) => Ok(handle.clone()),
            Backend::Unavailable(reason) => Err(SmartNoteError::ModelUnavailable(reason.clone())),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Backend::Ready(_))
    }
}

impl<H> From<Option<H>> for Backend<H> {
    fn from(handle: Option<H>) -> Self {
        match handle {
            Some(h) => Backend::Ready(h),
            None => Backend::Unavailable("not configured".to_string()),
        }
    }
}
