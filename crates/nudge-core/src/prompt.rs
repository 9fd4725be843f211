//! The durable prompt record and its lifecycle state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::timing::PromptTiming;

/// Delivery priority. `High` preempts `Medium` preempts `Low` at the head
/// of the dispatch queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    /// Numeric rank for queue ordering: lower dispatches first.
    pub fn rank(self) -> u8 {
        match self {
            Self::High => 0,
            Self::Medium => 1,
            Self::Low => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "high" => Some(Self::High),
            "medium" => Some(Self::Medium),
            "low" => Some(Self::Low),
            _ => None,
        }
    }
}

/// Lifecycle state of a prompt. Forward-only, except `Delivering → Queued`
/// on a failed delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptState {
    Pending,
    Queued,
    Delivering,
    Delivered,
    Responded,
    Expired,
    Failed,
}

impl PromptState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Delivering => "delivering",
            Self::Delivered => "delivered",
            Self::Responded => "responded",
            Self::Expired => "expired",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "queued" => Some(Self::Queued),
            "delivering" => Some(Self::Delivering),
            "delivered" => Some(Self::Delivered),
            "responded" => Some(Self::Responded),
            "expired" => Some(Self::Expired),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Terminal states admit no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Responded | Self::Expired | Self::Failed)
    }

    /// States in which a prompt counts as "in flight" for the dedup
    /// invariant: at most one per `(user, timing_type, subject)` tuple.
    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::Pending | Self::Queued | Self::Delivering)
    }

    /// Whether the state machine permits `self → to`.
    pub fn allows(self, to: PromptState) -> bool {
        use PromptState::*;
        matches!(
            (self, to),
            (Pending, Queued)
                | (Pending, Expired)
                | (Pending, Failed)
                | (Queued, Delivering)
                | (Queued, Expired)
                | (Queued, Failed)
                | (Delivering, Delivered)
                | (Delivering, Queued)
                | (Delivering, Failed)
                | (Delivered, Responded)
        )
    }
}

impl std::fmt::Display for PromptState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A delivery channel. The set is closed: sinks are pluggable behind the
/// `ChannelSink` trait, but the engine only routes across these three.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    InApp,
    Push,
    Email,
}

impl ChannelKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InApp => "in_app",
            Self::Push => "push",
            Self::Email => "email",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "in_app" => Some(Self::InApp),
            "push" => Some(Self::Push),
            "email" => Some(Self::Email),
            _ => None,
        }
    }

    /// In-app delivery requires a live push connection; the other channels
    /// reach the user regardless.
    pub fn requires_connection(self) -> bool {
        matches!(self, Self::InApp)
    }
}

/// A predefined reply option attached to a prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuickReply {
    /// Display text shown to the user.
    pub text: String,
    /// Opaque value submitted back on tap.
    pub value: String,
    /// Hint for what should happen after this reply (e.g. "snooze").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_step: Option<String>,
}

/// Rendered content of a prompt.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptContent {
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub quick_replies: Vec<QuickReply>,
}

/// Output of the content synthesizer for one admitted timing.
#[derive(Debug, Clone)]
pub struct SynthesizedPrompt {
    pub content: PromptContent,
    /// Per-prompt time-to-live override, in seconds.
    pub ttl_seconds: Option<i64>,
}

/// What the user did with a prompt, as a closed set of known actions.
///
/// Unrecognized tags land in `Unknown` rather than failing the reply; the
/// prompt still transitions to responded, only the side effect is skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseAction {
    /// Mark the habit referenced by the prompt's metadata as completed.
    CompleteHabit,
    /// Record a check-in with the reply value as the note.
    LogCheckin,
    /// Schedule a follow-up prompt after the configured snooze interval.
    Snooze,
    /// Acknowledge without any side effect.
    Dismiss,
    /// Unrecognized action tag, preserved verbatim.
    Unknown(String),
}

impl ResponseAction {
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "complete_now" | "complete_habit" => Self::CompleteHabit,
            "log_checkin" | "checkin_now" => Self::LogCheckin,
            "snooze" | "remind_later" => Self::Snooze,
            "dismiss" | "not_today" => Self::Dismiss,
            other => Self::Unknown(other.to_string()),
        }
    }

    pub fn as_tag(&self) -> &str {
        match self {
            Self::CompleteHabit => "complete_habit",
            Self::LogCheckin => "log_checkin",
            Self::Snooze => "snooze",
            Self::Dismiss => "dismiss",
            Self::Unknown(tag) => tag,
        }
    }
}

/// A single proactive message instance moving through
/// detection → delivery → response. Persisted; never deleted (terminal
/// states preserve the audit trail).
#[derive(Debug, Clone)]
pub struct Prompt {
    pub id: String,
    pub user_id: String,
    pub timing_type: String,
    pub priority: Priority,
    pub state: PromptState,
    pub content: PromptContent,
    /// Chosen delivery channel, set once on successful delivery.
    pub channel: Option<ChannelKind>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub responded_at: Option<DateTime<Utc>>,
    pub response_value: Option<String>,
    pub response_action: Option<ResponseAction>,
    /// Detector-specific context, read-only after creation.
    pub metadata: serde_json::Value,
    pub retry_count: u32,
    pub next_attempt_not_before: Option<DateTime<Utc>>,
    /// Parked prompts wait for a connection instead of burning retries.
    pub parked: bool,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Prompt {
    /// Build a fresh pending prompt from an admitted timing and
    /// synthesized content.
    pub fn from_timing(
        timing: &PromptTiming,
        content: PromptContent,
        scheduled_for: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: timing.user_id.clone(),
            timing_type: timing.kind.clone(),
            priority: timing.priority,
            state: PromptState::Pending,
            content,
            channel: None,
            scheduled_for: Some(scheduled_for),
            delivered_at: None,
            responded_at: None,
            response_value: None,
            response_action: None,
            metadata: timing.metadata.clone(),
            retry_count: 0,
            next_attempt_not_before: Some(scheduled_for),
            parked: false,
            expires_at,
            created_at: now,
        }
    }

    /// Build a terminally-failed prompt for a timing whose content
    /// synthesis failed. Never dispatched; kept for the audit trail.
    pub fn failed_synthesis(timing: &PromptTiming, expires_at: DateTime<Utc>) -> Self {
        let mut prompt = Self::from_timing(timing, PromptContent::default(), Utc::now(), expires_at);
        prompt.state = PromptState::Failed;
        prompt
    }

    /// Subject discriminator for the in-flight dedup invariant, taken from
    /// `metadata.subject_id`. Empty when the timing has no subject.
    pub fn subject_id(&self) -> &str {
        self.metadata
            .get("subject_id")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("")
    }

    /// Habit referenced by this prompt, if the detector attached one.
    pub fn habit_id(&self) -> Option<&str> {
        self.metadata
            .get("habit_id")
            .and_then(serde_json::Value::as_str)
    }
}

/// The rendered payload handed to a channel sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptPayload {
    pub prompt_id: String,
    pub title: String,
    pub body: String,
    pub quick_replies: Vec<QuickReply>,
    pub priority: Priority,
}

impl From<&Prompt> for PromptPayload {
    fn from(p: &Prompt) -> Self {
        Self {
            prompt_id: p.id.clone(),
            title: p.content.title.clone(),
            body: p.content.body.clone(),
            quick_replies: p.content.quick_replies.clone(),
            priority: p.priority,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn timing() -> PromptTiming {
        PromptTiming {
            kind: "habit_missed".into(),
            user_id: "u1".into(),
            priority: Priority::Medium,
            confidence: 0.8,
            metadata: json!({"subject_id": "h9", "habit_id": "h9"}),
        }
    }

    #[test]
    fn test_state_machine_forward_only() {
        use PromptState::*;
        assert!(Pending.allows(Queued));
        assert!(Queued.allows(Delivering));
        assert!(Delivering.allows(Delivered));
        assert!(Delivered.allows(Responded));
        // The one legal backward edge: retry.
        assert!(Delivering.allows(Queued));
        // No resurrection from terminal states.
        assert!(!Responded.allows(Queued));
        assert!(!Expired.allows(Delivering));
        assert!(!Failed.allows(Queued));
        // No skipping delivery.
        assert!(!Queued.allows(Delivered));
        assert!(!Pending.allows(Responded));
    }

    #[test]
    fn test_in_flight_states() {
        use PromptState::*;
        for s in [Pending, Queued, Delivering] {
            assert!(s.is_in_flight());
            assert!(!s.is_terminal());
        }
        for s in [Responded, Expired, Failed] {
            assert!(!s.is_in_flight());
            assert!(s.is_terminal());
        }
        assert!(!Delivered.is_in_flight());
        assert!(!Delivered.is_terminal());
    }

    #[test]
    fn test_response_action_tags() {
        assert_eq!(
            ResponseAction::from_tag("complete_now"),
            ResponseAction::CompleteHabit
        );
        assert_eq!(ResponseAction::from_tag("snooze"), ResponseAction::Snooze);
        assert_eq!(
            ResponseAction::from_tag("remind_later"),
            ResponseAction::Snooze
        );
        assert_eq!(
            ResponseAction::from_tag("do_a_flip"),
            ResponseAction::Unknown("do_a_flip".into())
        );
        assert_eq!(ResponseAction::from_tag("do_a_flip").as_tag(), "do_a_flip");
    }

    #[test]
    fn test_prompt_from_timing_carries_subject() {
        let p = Prompt::from_timing(
            &timing(),
            PromptContent::default(),
            Utc::now(),
            Utc::now() + chrono::Duration::hours(24),
        );
        assert_eq!(p.state, PromptState::Pending);
        assert_eq!(p.subject_id(), "h9");
        assert_eq!(p.habit_id(), Some("h9"));
        assert!(p.channel.is_none());
        assert!(p.delivered_at.is_none());
    }

    #[test]
    fn test_failed_synthesis_prompt_is_terminal() {
        let p = Prompt::failed_synthesis(&timing(), Utc::now() + chrono::Duration::hours(24));
        assert_eq!(p.state, PromptState::Failed);
        assert!(p.state.is_terminal());
    }

    #[test]
    fn test_priority_rank_order() {
        assert!(Priority::High.rank() < Priority::Medium.rank());
        assert!(Priority::Medium.rank() < Priority::Low.rank());
    }
}
