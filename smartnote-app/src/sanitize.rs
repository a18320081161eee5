//! Clean free text before it reaches a prompt.

use once_cell::sync::Lazy;
use regex::Regex;

/// Longest input accepted, in characters. Anything past it is dropped.
pub const MAX_INPUT_CHARS: usize = 50_000;

const FILTERED: &str = "[FILTERED]";

/// Applied in order, each over the whole text.
static INJECTION_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)ignore\s+(all\s+)?(previous|above)\s+instructions?",
        r"(?i)disregard\s+(all\s+)?(previous|above)",
        r"(?i)forget\s+(everything|all)",
        r"(?i)you\s+are\s+now\s+a",
        r"(?i)new\s+instructions?:",
        r"(?i)system\s*:\s*",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("Invalid injection regex"))
    .collect()
});

static INLINE_SPACE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[ \t]+").expect("Invalid whitespace regex"));

static BLANK_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{4,}").expect("Invalid newline regex"));

/// Truncate, strip control characters (newlines and tabs survive), filter
/// common prompt-injection phrases, and squeeze whitespace runs.
/// Returns an empty string when nothing usable remains.
pub fn sanitize_input(text: &str) -> String {
    let mut out: String = text
        .chars()
        .take(MAX_INPUT_CHARS)
        .filter(|&c| c == '\n' || c == '\t' || !c.is_control())
        .collect();

    for pattern in INJECTION_PATTERNS.iter() {
        if pattern.is_match(&out) {
            out = pattern.replace_all(&out, FILTERED).into_owned();
        }
    }

    let out = INLINE_SPACE.replace_all(&out, " ");
    let out = BLANK_RUN.replace_all(&out, "\n\n\n");
    out.trim().to_string()
}
