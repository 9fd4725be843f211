//! Deterministic template synthesizer for offline and development use.

use async_trait::async_trait;
use nudge_core::{
    error::NudgeError,
    prompt::{PromptContent, QuickReply, SynthesizedPrompt},
    snapshot::UserSnapshot,
    timing::{PromptTiming, TIMING_DAILY_CHECKIN, TIMING_HABIT_MISSED, TIMING_PROGRESS_STALLED},
    traits::ContentSynthesizer,
};

/// Template-based synthesizer. Produces fixed wording per timing kind; no
/// network, no failure modes.
#[derive(Default)]
pub struct CannedSynthesizer;

impl CannedSynthesizer {
    pub fn new() -> Self {
        Self
    }
}

fn reply(text: &str, value: &str, next_step: Option<&str>) -> QuickReply {
    QuickReply {
        text: text.to_string(),
        value: value.to_string(),
        next_step: next_step.map(str::to_string),
    }
}

#[async_trait]
impl ContentSynthesizer for CannedSynthesizer {
    fn name(&self) -> &str {
        "canned"
    }

    async fn synthesize(
        &self,
        timing: &PromptTiming,
        _snapshot: &UserSnapshot,
    ) -> Result<SynthesizedPrompt, NudgeError> {
        let habit_name = timing
            .metadata
            .get("habit_name")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("your habit");

        let content = match timing.kind.as_str() {
            TIMING_DAILY_CHECKIN => PromptContent {
                title: "Daily check-in".into(),
                body: "How is your day going? A quick log keeps your progress on track.".into(),
                quick_replies: vec![
                    reply("Log now", "checkin_now", None),
                    reply("Later", "remind_later", Some("snooze")),
                    reply("Not today", "not_today", None),
                ],
            },
            TIMING_HABIT_MISSED => PromptContent {
                title: format!("Don't lose your streak: {habit_name}"),
                body: format!("It's been a couple of days since {habit_name}. A small step today counts."),
                quick_replies: vec![
                    reply("Done!", "complete_now", None),
                    reply("Remind me later", "remind_later", Some("snooze")),
                    reply("Skip", "dismiss", None),
                ],
            },
            TIMING_PROGRESS_STALLED => PromptContent {
                title: "Checking in on your goal".into(),
                body: "Progress has been quiet for a few days. Want to log where you're at?".into(),
                quick_replies: vec![
                    reply("Log progress", "checkin_now", None),
                    reply("Dismiss", "dismiss", None),
                ],
            },
            other => PromptContent {
                title: "A note from your coach".into(),
                body: format!("Your coach wanted to check in ({other})."),
                quick_replies: vec![reply("Thanks", "dismiss", None)],
            },
        };

        Ok(SynthesizedPrompt {
            content,
            ttl_seconds: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nudge_core::prompt::Priority;
    use serde_json::json;

    #[tokio::test]
    async fn test_canned_habit_prompt_uses_habit_name() {
        let synth = CannedSynthesizer::new();
        let timing = PromptTiming {
            kind: TIMING_HABIT_MISSED.into(),
            user_id: "u1".into(),
            priority: Priority::Medium,
            confidence: 0.8,
            metadata: json!({"habit_name": "morning run", "habit_id": "h1", "subject_id": "h1"}),
        };
        let out = synth
            .synthesize(&timing, &UserSnapshot::empty("u1"))
            .await
            .unwrap();
        assert!(out.content.title.contains("morning run"));
        assert!(out
            .content
            .quick_replies
            .iter()
            .any(|q| q.value == "complete_now"));
    }

    #[tokio::test]
    async fn test_canned_unknown_kind_still_produces_content() {
        let synth = CannedSynthesizer::new();
        let timing = PromptTiming {
            kind: "sleep_hygiene".into(),
            user_id: "u1".into(),
            priority: Priority::Low,
            confidence: 0.5,
            metadata: json!({}),
        };
        let out = synth
            .synthesize(&timing, &UserSnapshot::empty("u1"))
            .await
            .unwrap();
        assert!(!out.content.title.is_empty());
        assert!(!out.content.body.is_empty());
    }
}
