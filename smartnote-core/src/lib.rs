//! # smartnote-core
//!
//! Admission control and summarisation core for a local dental-consultation
//! backend.
//!
//! ## Architecture
//!
//! ```text
//! request ─► RateLimiter (per client, per tier)
//!               │
//!               ├─ summarize* ─► InferenceGate (N slots, priority queue) ─► LanguageModel
//!               │                     ▲
//!               │        Summarizer ──┘  (chunks at Batch priority, then combine)
//!               │
//!               ├─ transcribe ─► WorkerPool "whisper" ─► Transcriber
//!               └─ retrieve ───► WorkerPool "rag" ─────► Retriever
//!
//! SystemStatus = every pool + gate under "llm"
//! ```
//!
//! Blocking model calls never run on the async runtime's worker threads:
//! generation uses `spawn_blocking`, pools own dedicated executor threads.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod admission;
pub mod config;
pub mod engine;
pub mod error;
pub mod inference;
pub mod pool;
pub mod ratelimit;
pub mod status;
pub mod summarize;

// Convenience re-exports for downstream crates
pub use admission::{CancellationFlag, GatePermit, GateStatus, InferenceGate, Priority};
pub use config::BackendConfig;
pub use engine::{EngineBackends, SmartNoteEngine};
pub use error::{Result, SmartNoteError};
pub use inference::{
    Backend, ContextSnippet, LanguageModel, ModelHandle, Retriever, RetrieverHandle, TokenStream,
    Transcriber, TranscriberHandle,
};
pub use pool::{PoolConfig, PoolStatus, WorkerPool, WorkerPools};
pub use ratelimit::{RateLimitDecision, RateLimiter, Tier};
pub use status::SystemStatus;
pub use summarize::{SmartNote, Summarizer};
