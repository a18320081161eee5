use std::time::Duration;

use thiserror::Error;

/// All errors produced by smartnote-core.
#[derive(Debug, Error)]
pub enum SmartNoteError {
    /// Admission could not be granted within the caller's wait budget.
    #[error("{resource} is busy: {detail}")]
    Busy { resource: String, detail: String },

    #[error("rate limit exceeded for tier {tier}; retry in {retry_after:?}")]
    RateLimited { tier: String, retry_after: Duration },

    /// A queued request was skipped because its cancellation flag was set.
    #[error("request cancelled before admission")]
    Cancelled,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("inference error: {0}")]
    Inference(String),

    #[error("transcription error: {0}")]
    Transcription(String),

    #[error("unknown worker pool: '{0}'")]
    UnknownPool(String),

    #[cfg(feature = "sqlite-store")]
    #[error("rate-limit store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SmartNoteError {
    pub(crate) fn busy(resource: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Busy {
            resource: resource.into(),
            detail: detail.into(),
        }
    }

    /// `true` for admission-layer rejections (gate, pool, or rate limit)
    /// that the caller should retry later.
    pub fn is_admission(&self) -> bool {
        matches!(self, Self::Busy { .. } | Self::RateLimited { .. })
    }
}

pub type Result<T> = std::result::Result<T, SmartNoteError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admission_errors_are_classified_apart_from_work_errors() {
        assert!(SmartNoteError::busy("llm", "queue full").is_admission());
        assert!(SmartNoteError::RateLimited {
            tier: "heavy".into(),
            retry_after: Duration::from_secs(3),
        }
        .is_admission());
        assert!(!SmartNoteError::Inference("bad output".into()).is_admission());
        assert!(!SmartNoteError::Cancelled.is_admission());
    }

    #[test]
    fn busy_message_names_the_resource() {
        let err = SmartNoteError::busy("worker pool 'whisper'", "1 slot(s) occupied for >2s");
        assert_eq!(
            err.to_string(),
            "worker pool 'whisper' is busy: 1 slot(s) occupied for >2s"
        );
    }
}
