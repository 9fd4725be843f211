use crate::{
    error::NudgeError,
    prompt::{ChannelKind, PromptPayload, SynthesizedPrompt},
    snapshot::UserSnapshot,
    timing::PromptTiming,
};
use async_trait::async_trait;

/// Content Synthesizer trait — the voice.
///
/// Given an admitted timing and the user's context, produces the prompt
/// wording and quick-reply options. Implementations must fail closed:
/// an explicit error, never malformed content.
#[async_trait]
pub trait ContentSynthesizer: Send + Sync {
    /// Human-readable synthesizer name.
    fn name(&self) -> &str;

    /// Synthesize prompt content for a timing.
    async fn synthesize(
        &self,
        timing: &PromptTiming,
        snapshot: &UserSnapshot,
    ) -> Result<SynthesizedPrompt, NudgeError>;
}

/// Heuristic timing detector trait — candidate timings beyond the
/// rule set, typically backed by an AI service. Failures yield no
/// candidates and never abort a detection cycle.
#[async_trait]
pub trait TimingHeuristic: Send + Sync {
    /// Human-readable detector name.
    fn name(&self) -> &str;

    /// Return zero or more candidate timings for this user.
    async fn detect(&self, snapshot: &UserSnapshot) -> Result<Vec<PromptTiming>, NudgeError>;
}

/// Channel sink trait — the last mile.
///
/// Every delivery mechanism (in-app connection, push notification, email)
/// implements this trait; implementations are interchangeable.
#[async_trait]
pub trait ChannelSink: Send + Sync {
    /// Which channel this sink serves.
    fn kind(&self) -> ChannelKind;

    /// Attempt one delivery. The dispatcher wraps this call in a bounded
    /// timeout; implementations need not enforce their own.
    async fn send(&self, user_id: &str, payload: &PromptPayload) -> Result<(), NudgeError>;
}

/// Health-record side effects triggered by prompt replies, executed by an
/// external service.
#[async_trait]
pub trait RecordService: Send + Sync {
    /// Human-readable service name.
    fn name(&self) -> &str;

    /// Mark a habit completed for the user.
    async fn complete_habit(&self, user_id: &str, habit_id: &str) -> Result<(), NudgeError>;

    /// Record a check-in note for the user.
    async fn log_checkin(&self, user_id: &str, note: &str) -> Result<(), NudgeError>;
}

/// Read access to the per-user state the detector scans. The set of
/// "active" users is defined by the host application, not the engine.
#[async_trait]
pub trait UserStateSource: Send + Sync {
    async fn active_users(&self) -> Result<Vec<String>, NudgeError>;

    async fn snapshot(&self, user_id: &str) -> Result<UserSnapshot, NudgeError>;
}
