//! Transcript → SmartNote.
//!
//! Short transcripts go to the model in one call. Long ones are split on
//! sentence boundaries into token-bounded chunks, each chunk is summarised
//! at batch priority, and the partial summaries are merged by one final
//! combination call.

pub mod prompts;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::admission::{CancellationFlag, Priority};
use crate::error::{Result, SmartNoteError};
use crate::inference::LocalLlm;

/// Size thresholds, all in estimated tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkingConfig {
    /// Above this, the transcript is chunked.
    pub threshold_tokens: usize,
    /// Upper bound per chunk (a single longer sentence still forms a chunk).
    pub chunk_tokens: usize,
    pub chars_per_token: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            threshold_tokens: 3000,
            chunk_tokens: 2000,
            chars_per_token: 3,
        }
    }
}

/// Rough token count: characters divided by a fixed ratio.
pub fn estimate_tokens(text: &str, chars_per_token: usize) -> usize {
    text.chars().count() / chars_per_token.max(1)
}

/// Split into sentences. A sentence ends at `.`, `!` or `?` followed by
/// whitespace (or end of input), or at a newline. Terminators are kept.
pub fn split_sentences(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        let end = i + c.len_utf8();
        let boundary = match c {
            '\n' => true,
            '.' | '!' | '?' => chars.peek().map_or(true, |&(_, next)| next.is_whitespace()),
            _ => false,
        };
        if boundary {
            let sentence = text[start..end].trim();
            if !sentence.is_empty() {
                out.push(sentence);
            }
            start = end;
        }
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        out.push(tail);
    }
    out
}

/// Greedily pack whole sentences into chunks of at most `max_tokens`.
pub fn chunk_text(text: &str, max_tokens: usize, chars_per_token: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    for sentence in split_sentences(text) {
        if !current.is_empty() {
            let candidate_len = current.chars().count() + 1 + sentence.chars().count();
            if candidate_len / chars_per_token.max(1) > max_tokens {
                chunks.push(std::mem::take(&mut current));
            }
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(sentence);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// How a note was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SummaryStrategy {
    /// One call on the whole transcript.
    Direct,
    /// Per-chunk summaries merged by a combination call (or a single chunk
    /// returned as is).
    Chunked,
    /// Combination failed; the note is the joined chunk summaries.
    Concatenated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteSection {
    pub name: String,
    pub content: String,
}

/// A structured consultation note.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmartNote {
    /// Model output with stop tokens removed.
    pub text: String,
    /// Recognised sections in output order. Empty if the text had none.
    pub sections: Vec<NoteSection>,
    pub strategy: SummaryStrategy,
    pub chunks: usize,
}

impl SmartNote {
    fn new(text: String, strategy: SummaryStrategy, chunks: usize) -> Self {
        let sections = parse_sections(&text);
        Self {
            text,
            sections,
            strategy,
            chunks,
        }
    }

    pub fn section(&self, name: &str) -> Option<&str> {
        self.sections
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.content.as_str())
    }

    pub fn is_structured(&self) -> bool {
        !self.sections.is_empty()
    }
}

fn fold_accents(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            'é' | 'è' | 'ê' | 'ë' | 'É' | 'È' => 'e',
            'à' | 'â' => 'a',
            'î' | 'ï' => 'i',
            'ô' => 'o',
            'ù' | 'û' => 'u',
            other => other.to_ascii_lowercase(),
        })
        .collect()
}

/// Pull `- <Section> : <content>` lines for the known sections. Bullets may
/// be `-`, `*` or `•`; section names match case- and accent-insensitively.
pub fn parse_sections(text: &str) -> Vec<NoteSection> {
    text.lines()
        .filter_map(|line| {
            let line = line.trim();
            let body = line
                .strip_prefix('-')
                .or_else(|| line.strip_prefix('*'))
                .or_else(|| line.strip_prefix('•'))?;
            let (name, content) = body.split_once(':')?;
            let folded = fold_accents(name.trim().trim_matches('*'));
            let canonical = prompts::SECTIONS
                .iter()
                .find(|s| fold_accents(s) == folded)?;
            Some(NoteSection {
                name: (*canonical).to_string(),
                content: content.trim().to_string(),
            })
        })
        .collect()
}

/// Summarisation policy on top of the shared language model.
#[derive(Debug, Clone)]
pub struct Summarizer {
    llm: Arc<LocalLlm>,
    chunking: ChunkingConfig,
}

impl Summarizer {
    pub fn new(llm: Arc<LocalLlm>, chunking: ChunkingConfig) -> Self {
        Self { llm, chunking }
    }

    pub fn chunking(&self) -> &ChunkingConfig {
        &self.chunking
    }

    pub fn needs_chunking(&self, transcript: &str) -> bool {
        estimate_tokens(transcript, self.chunking.chars_per_token) > self.chunking.threshold_tokens
    }

    /// Summarise a transcript, chunking when it is too long for one call.
    ///
    /// # Errors
    /// `InvalidInput` for a blank transcript; admission errors and
    /// `Cancelled` propagate; `Inference` if no usable output was produced.
    pub async fn summarize(
        &self,
        transcript: &str,
        priority: Priority,
        cancel: &CancellationFlag,
    ) -> Result<SmartNote> {
        self.summarize_with_context(transcript, "", priority, cancel)
            .await
    }

    /// As [`summarize`](Self::summarize), grounding the note with retrieved
    /// `context`. The context is only used when the transcript fits one
    /// call; chunked summaries ignore it.
    pub async fn summarize_with_context(
        &self,
        transcript: &str,
        context: &str,
        priority: Priority,
        cancel: &CancellationFlag,
    ) -> Result<SmartNote> {
        let transcript = transcript.trim();
        if transcript.is_empty() {
            return Err(SmartNoteError::InvalidInput("transcript is empty".into()));
        }

        if !self.needs_chunking(transcript) {
            let prompt = prompts::smartnote_with_context(transcript, context);
            let raw = self.llm.generate(prompt, priority, cancel).await?;
            let note = SmartNote::new(raw, SummaryStrategy::Direct, 1);
            if !note.is_structured() {
                warn!(chars = note.text.len(), "summary has no recognised sections, keeping raw text");
            }
            return Ok(note);
        }

        if !context.trim().is_empty() {
            debug!("transcript needs chunking, retrieval context not used");
        }
        let chunks = chunk_text(
            transcript,
            self.chunking.chunk_tokens,
            self.chunking.chars_per_token,
        );
        let span = info_span!("summarize", chunks = chunks.len());
        self.summarize_chunks(chunks, cancel).instrument(span).await
    }

    async fn summarize_chunks(
        &self,
        chunks: Vec<String>,
        cancel: &CancellationFlag,
    ) -> Result<SmartNote> {
        let total = chunks.len();
        info!(total, "summarising in chunks");

        let mut summaries = Vec::with_capacity(total);
        for (i, chunk) in chunks.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(SmartNoteError::Cancelled);
            }
            let prompt = prompts::chunk_summary(i + 1, total, chunk);
            match self.llm.generate(prompt, Priority::Batch, cancel).await {
                Ok(summary) => summaries.push(summary),
                Err(e) if is_fatal(&e) => return Err(e),
                Err(e) => warn!(part = i + 1, total, error = %e, "chunk summary failed, skipped"),
            }
        }

        if summaries.is_empty() {
            return Err(SmartNoteError::Inference(format!(
                "no usable summary for any of {total} chunk(s)"
            )));
        }
        if total == 1 {
            let only = summaries.remove(0);
            return Ok(SmartNote::new(only, SummaryStrategy::Chunked, 1));
        }

        let joined = summaries.join("\n\n");
        let prompt = prompts::combine_summaries(&joined);
        match self.llm.generate(prompt, Priority::Batch, cancel).await {
            Ok(raw) => {
                let note = SmartNote::new(raw, SummaryStrategy::Chunked, total);
                if note.is_structured() {
                    Ok(note)
                } else {
                    warn!("combined summary has no recognised sections, using concatenation");
                    Ok(SmartNote::new(joined, SummaryStrategy::Concatenated, total))
                }
            }
            Err(SmartNoteError::Cancelled) => Err(SmartNoteError::Cancelled),
            Err(e) => {
                warn!(error = %e, "combination failed, using concatenation");
                Ok(SmartNote::new(joined, SummaryStrategy::Concatenated, total))
            }
        }
    }
}

/// Errors that end a chunked run instead of skipping one chunk.
fn is_fatal(e: &SmartNoteError) -> bool {
    e.is_admission()
        || matches!(
            e,
            SmartNoteError::Cancelled | SmartNoteError::ModelUnavailable(_)
        )
}
