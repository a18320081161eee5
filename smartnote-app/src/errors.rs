//! Client-facing error catalogue.
//!
//! Every failure a command can return maps to a `DOMAIN_NNN` code, an
//! HTTP-style status and a fixed message. `detail` carries the specifics and
//! `request_id` ties the response to the log line.

use std::fmt;

use serde::Serialize;
use smartnote_core::SmartNoteError;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorDef {
    pub code: &'static str,
    pub status: u16,
    pub message: &'static str,
}

const fn def(code: &'static str, status: u16, message: &'static str) -> ErrorDef {
    ErrorDef {
        code,
        status,
        message,
    }
}

pub const INPUT_EMPTY_TEXT: ErrorDef = def(
    "INPUT_001",
    400,
    "Text input is empty or invalid after sanitization.",
);
pub const INPUT_UNSUPPORTED_EXT: ErrorDef = def("INPUT_003", 400, "Unsupported file extension.");
pub const INPUT_TOO_LARGE: ErrorDef = def("INPUT_004", 413, "Request entity too large.");

pub const MODEL_LLM_NOT_FOUND: ErrorDef = def(
    "MODEL_001",
    503,
    "LLM model not downloaded. Please run setup first.",
);
pub const MODEL_WHISPER_NOT_FOUND: ErrorDef = def(
    "MODEL_002",
    503,
    "Whisper model not downloaded. Please download the model first.",
);

pub const INFERENCE_BUSY: ErrorDef = def(
    "INFERENCE_001",
    503,
    "Server is busy processing other requests. Please try again later.",
);
pub const INFERENCE_LLM_BAD_OUTPUT: ErrorDef = def(
    "INFERENCE_002",
    500,
    "LLM returned an unexpected response format.",
);
pub const INFERENCE_STREAM_ERROR: ErrorDef = def(
    "INFERENCE_003",
    500,
    "An error occurred during streaming generation.",
);
pub const INFERENCE_TRANSCRIPTION_FAILED: ErrorDef =
    def("INFERENCE_004", 500, "Transcription failed.");

pub const SYSTEM_CLIENT_DISCONNECTED: ErrorDef = def(
    "SYSTEM_002",
    499,
    "Client closed the connection before processing completed.",
);
pub const SYSTEM_RATE_LIMITED: ErrorDef =
    def("SYSTEM_003", 429, "Too many requests. Please slow down.");
pub const SYSTEM_INTERNAL: ErrorDef = def("SYSTEM_004", 500, "Internal server error.");

/// Structured command failure, serialised as the response body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandError {
    pub error_code: &'static str,
    pub message: &'static str,
    pub detail: Option<String>,
    pub request_id: String,
    #[serde(skip)]
    pub status: u16,
    /// Response headers, e.g. `Retry-After` on a rate-limit rejection.
    #[serde(skip)]
    pub headers: Vec<(&'static str, String)>,
}

impl CommandError {
    pub fn new(def: ErrorDef, detail: Option<String>) -> Self {
        let err = Self {
            error_code: def.code,
            message: def.message,
            detail,
            request_id: new_request_id(),
            status: def.status,
            headers: Vec::new(),
        };
        warn!(
            code = err.error_code,
            status = err.status,
            detail = err.detail.as_deref().unwrap_or(""),
            request_id = %err.request_id,
            "{}",
            err.message
        );
        err
    }

    pub fn with_headers(mut self, headers: Vec<(&'static str, String)>) -> Self {
        self.headers = headers;
        self
    }

    /// Same mapping as `From`, except that generation failures report the
    /// streaming code.
    pub fn stream(err: SmartNoteError) -> Self {
        match err {
            SmartNoteError::Inference(detail) => Self::new(INFERENCE_STREAM_ERROR, Some(detail)),
            other => other.into(),
        }
    }
}

impl From<SmartNoteError> for CommandError {
    fn from(err: SmartNoteError) -> Self {
        match err {
            SmartNoteError::Busy { resource, detail } => {
                Self::new(INFERENCE_BUSY, Some(format!("{resource}: {detail}")))
            }
            SmartNoteError::RateLimited { tier, retry_after } => Self::new(
                SYSTEM_RATE_LIMITED,
                Some(format!(
                    "{tier} tier, retry in {:.1}s",
                    retry_after.as_secs_f64()
                )),
            ),
            SmartNoteError::Cancelled => Self::new(SYSTEM_CLIENT_DISCONNECTED, None),
            SmartNoteError::InvalidInput(detail) => Self::new(INPUT_EMPTY_TEXT, Some(detail)),
            SmartNoteError::ModelUnavailable(detail) => {
                Self::new(MODEL_LLM_NOT_FOUND, Some(detail))
            }
            SmartNoteError::Inference(detail) => Self::new(INFERENCE_LLM_BAD_OUTPUT, Some(detail)),
            SmartNoteError::Transcription(detail) => {
                Self::new(INFERENCE_TRANSCRIPTION_FAILED, Some(detail))
            }
            other => Self::new(SYSTEM_INTERNAL, Some(other.to_string())),
        }
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.error_code, self.message)?;
        if let Some(detail) = &self.detail {
            write!(f, " ({detail})")?;
        }
        write!(f, " request_id={}", self.request_id)
    }
}

impl std::error::Error for CommandError {}

/// 12 lowercase hex digits.
pub(crate) fn new_request_id() -> String {
    format!("{:012x}", rand::random::<u64>() >> 16)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn core_errors_map_to_catalogue_codes() {
        let cases = [
            (
                SmartNoteError::Busy {
                    resource: "llm".into(),
                    detail: "queue wait exceeded".into(),
                },
                "INFERENCE_001",
                503,
            ),
            (
                SmartNoteError::RateLimited {
                    tier: "heavy".into(),
                    retry_after: Duration::from_secs(4),
                },
                "SYSTEM_003",
                429,
            ),
            (SmartNoteError::Cancelled, "SYSTEM_002", 499),
            (SmartNoteError::InvalidInput("empty".into()), "INPUT_001", 400),
            (SmartNoteError::ModelUnavailable("no gguf".into()), "MODEL_001", 503),
            (SmartNoteError::Inference("empty output".into()), "INFERENCE_002", 500),
            (SmartNoteError::Transcription("bad wav".into()), "INFERENCE_004", 500),
            (SmartNoteError::UnknownPool("gpu".into()), "SYSTEM_004", 500),
        ];
        for (err, code, status) in cases {
            let mapped = CommandError::from(err);
            assert_eq!(mapped.error_code, code);
            assert_eq!(mapped.status, status);
        }
    }

    #[test]
    fn stream_failures_use_the_stream_code() {
        let err = CommandError::stream(SmartNoteError::Inference("decoder died".into()));
        assert_eq!(err.error_code, "INFERENCE_003");
        assert_eq!(err.detail.as_deref(), Some("decoder died"));

        let busy = CommandError::stream(SmartNoteError::Busy {
            resource: "llm".into(),
            detail: "full".into(),
        });
        assert_eq!(busy.error_code, "INFERENCE_001");
    }

    #[test]
    fn request_ids_are_twelve_hex_digits() {
        for _ in 0..32 {
            let id = new_request_id();
            assert_eq!(id.len(), 12);
            assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        }
    }

    #[test]
    fn body_omits_status_and_headers() {
        let err = CommandError::new(SYSTEM_RATE_LIMITED, None)
            .with_headers(vec![("Retry-After", "3".into())]);
        let json = serde_json::to_value(&err).expect("serialize");
        assert_eq!(json["error_code"], "SYSTEM_003");
        assert_eq!(json["detail"], serde_json::Value::Null);
        assert!(json.get("status").is_none());
        assert!(json.get("headers").is_none());
    }
}
