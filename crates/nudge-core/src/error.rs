use thiserror::Error;

/// Top-level error type for the nudge engine.
#[derive(Debug, Error)]
pub enum NudgeError {
    /// Error while detecting prompt timings for a user.
    #[error("detection error: {0}")]
    Detection(String),

    /// Error from the external content synthesizer.
    #[error("synthesis error: {0}")]
    Synthesis(String),

    /// Error while delivering a prompt through a channel sink.
    #[error("delivery error: {0}")]
    Delivery(String),

    /// Error in the connection registry or fan-out layer.
    #[error("registry error: {0}")]
    Registry(String),

    /// Storage error.
    #[error("store error: {0}")]
    Store(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// A client reply was rejected during validation.
    #[error("reply rejected: {0}")]
    Reply(#[from] ReplyRejection),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Why an inbound reply was rejected.
///
/// Each variant maps to a stable wire code so clients can distinguish
/// "refresh your state" from "you sent the wrong thing".
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReplyRejection {
    /// No prompt exists with the given id.
    #[error("prompt not found")]
    NotFound,

    /// The prompt is no longer awaiting a reply. Duplicate submissions for
    /// an already-responded prompt land here, which is the idempotency guard.
    #[error("prompt is not awaiting a reply (state: {state})")]
    Stale { state: String },

    /// The replying user does not own the prompt.
    #[error("prompt belongs to a different user")]
    OwnershipMismatch,
}

impl ReplyRejection {
    /// Stable error code surfaced to API clients.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Stale { .. } => "stale_prompt",
            Self::OwnershipMismatch => "ownership_mismatch",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_codes_are_distinct() {
        let codes = [
            ReplyRejection::NotFound.code(),
            ReplyRejection::Stale {
                state: "responded".into(),
            }
            .code(),
            ReplyRejection::OwnershipMismatch.code(),
        ];
        assert_eq!(codes, ["not_found", "stale_prompt", "ownership_mismatch"]);
    }

    #[test]
    fn test_rejection_converts_into_nudge_error() {
        let err: NudgeError = ReplyRejection::NotFound.into();
        assert!(matches!(err, NudgeError::Reply(ReplyRejection::NotFound)));
    }
}
