//! Response handler: validates inbound replies, transitions the prompt to
//! RESPONDED, runs the side effect for the reply's action, and optionally
//! schedules a follow-up prompt.

use super::{assembly, Engine};
use crate::registry::StreamEvent;
use chrono::{DateTime, Duration, Utc};
use nudge_core::{
    error::{NudgeError, ReplyRejection},
    prompt::{Prompt, PromptState, ResponseAction},
    timing::PromptTiming,
};
use nudge_store::{DeliveryEvent, DeliveryEventKind};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, info, warn};

/// An inbound reply from the client endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplyRequest {
    pub prompt_id: String,
    pub user_id: String,
    /// The tapped quick-reply value (or free-form reply text).
    pub value: String,
    /// Explicit action tag; defaults to the value when omitted.
    #[serde(default)]
    pub action: Option<String>,
    /// Client-side timestamp, informational only.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

/// What the handler did with an accepted reply.
#[derive(Debug, Clone, Serialize)]
pub struct ReplyOutcome {
    pub result: String,
    pub follow_up_scheduled: bool,
}

impl Engine {
    /// Handle one inbound reply.
    ///
    /// Validation order: the prompt must exist, must belong to the
    /// replying user, and must still be awaiting a reply. The RESPONDED
    /// transition is a CAS, so a duplicate submission races at most one
    /// winner — the side effect runs exactly once.
    pub async fn handle_reply(&self, request: &ReplyRequest) -> Result<ReplyOutcome, NudgeError> {
        debug!(
            "reply for {} from {} (client ts {:?})",
            request.prompt_id, request.user_id, request.timestamp
        );

        let prompt = self
            .store
            .get_prompt(&request.prompt_id)
            .await?
            .ok_or(ReplyRejection::NotFound)?;

        if prompt.user_id != request.user_id {
            warn!(
                "reply to {} rejected: user {} does not own it",
                prompt.id, request.user_id
            );
            return Err(ReplyRejection::OwnershipMismatch.into());
        }

        if prompt.state != PromptState::Delivered {
            self.log_rejected(&prompt, "stale state").await;
            return Err(ReplyRejection::Stale {
                state: prompt.state.to_string(),
            }
            .into());
        }

        let action = ResponseAction::from_tag(request.action.as_deref().unwrap_or(&request.value));

        if !self
            .store
            .mark_responded(&prompt.id, &request.value, &action)
            .await?
        {
            // Lost the CAS to a concurrent duplicate submission.
            let state = match self.store.get_prompt(&prompt.id).await? {
                Some(current) => current.state.to_string(),
                None => PromptState::Responded.to_string(),
            };
            self.log_rejected(&prompt, "lost response race").await;
            return Err(ReplyRejection::Stale { state }.into());
        }

        info!(
            "prompt {} responded by user {} ({})",
            prompt.id,
            prompt.user_id,
            action.as_tag()
        );
        if let Err(e) = self
            .log
            .log(&DeliveryEvent {
                prompt_id: prompt.id.clone(),
                user_id: prompt.user_id.clone(),
                channel: prompt.channel,
                kind: DeliveryEventKind::Responded,
                detail: Some(request.value.clone()),
            })
            .await
        {
            error!("delivery log write failed for {}: {e}", prompt.id);
        }

        let (result, follow_up_scheduled) = self.run_side_effect(&prompt, &action, request).await;

        // Best-effort echo to the user's live connections.
        let receipt = json!({
            "prompt_id": prompt.id,
            "result": result,
            "follow_up_scheduled": follow_up_scheduled,
        });
        if let Err(e) = self
            .registry
            .send_to_user(
                &prompt.user_id,
                StreamEvent::new("response_result", receipt.to_string()),
            )
            .await
        {
            debug!("no live connection for response receipt: {e}");
        }

        Ok(ReplyOutcome {
            result,
            follow_up_scheduled,
        })
    }

    /// Dispatch the closed action set to its side effect. Side-effect
    /// failures are reported in the result string but do not undo the
    /// response transition.
    async fn run_side_effect(
        &self,
        prompt: &Prompt,
        action: &ResponseAction,
        request: &ReplyRequest,
    ) -> (String, bool) {
        match action {
            ResponseAction::CompleteHabit => {
                let Some(habit_id) = prompt.habit_id() else {
                    warn!("prompt {} has no habit_id; completion skipped", prompt.id);
                    return ("recorded".to_string(), false);
                };
                match self.records.complete_habit(&prompt.user_id, habit_id).await {
                    Ok(()) => ("habit_completed".to_string(), false),
                    Err(e) => {
                        error!("habit completion for {} failed: {e}", prompt.id);
                        self.log_side_effect_failure(prompt, e.to_string()).await;
                        ("side_effect_failed".to_string(), false)
                    }
                }
            }
            ResponseAction::LogCheckin => {
                match self
                    .records
                    .log_checkin(&prompt.user_id, &request.value)
                    .await
                {
                    Ok(()) => ("checkin_logged".to_string(), false),
                    Err(e) => {
                        error!("check-in logging for {} failed: {e}", prompt.id);
                        self.log_side_effect_failure(prompt, e.to_string()).await;
                        ("side_effect_failed".to_string(), false)
                    }
                }
            }
            ResponseAction::Snooze => {
                let scheduled = self.schedule_follow_up(prompt).await;
                ("snoozed".to_string(), scheduled)
            }
            ResponseAction::Dismiss => ("dismissed".to_string(), false),
            ResponseAction::Unknown(tag) => {
                warn!("unknown response action '{tag}' on prompt {}", prompt.id);
                ("recorded".to_string(), false)
            }
        }
    }

    /// Synthesize and enqueue a follow-up prompt after the snooze
    /// interval. A fresh prompt re-entering the assembly pipeline, never a
    /// mutation of the original.
    async fn schedule_follow_up(&self, prompt: &Prompt) -> bool {
        let timing = PromptTiming {
            kind: prompt.timing_type.clone(),
            user_id: prompt.user_id.clone(),
            priority: prompt.priority,
            confidence: 1.0,
            metadata: prompt.metadata.clone(),
        };
        let snapshot = match self.source.snapshot(&prompt.user_id).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!("follow-up snapshot for {} failed: {e}", prompt.user_id);
                return false;
            }
        };
        let scheduled_for = Utc::now() + Duration::minutes(self.config.responses.snooze_minutes);

        match assembly::assemble_and_enqueue(
            &self.store,
            &*self.synthesizer,
            &self.queue,
            &self.log,
            &self.config,
            &timing,
            &snapshot,
            scheduled_for,
        )
        .await
        {
            Ok(Some(follow_up_id)) => {
                info!(
                    "scheduled follow-up {follow_up_id} for prompt {} at {scheduled_for}",
                    prompt.id
                );
                true
            }
            Ok(None) => false,
            Err(e) => {
                error!("follow-up assembly for {} failed: {e}", prompt.id);
                false
            }
        }
    }

    async fn log_rejected(&self, prompt: &Prompt, detail: &str) {
        if let Err(e) = self
            .log
            .log(&DeliveryEvent {
                prompt_id: prompt.id.clone(),
                user_id: prompt.user_id.clone(),
                channel: prompt.channel,
                kind: DeliveryEventKind::ReplyRejected,
                detail: Some(detail.to_string()),
            })
            .await
        {
            error!("delivery log write failed for {}: {e}", prompt.id);
        }
    }

    async fn log_side_effect_failure(&self, prompt: &Prompt, detail: String) {
        if let Err(e) = self
            .log
            .log(&DeliveryEvent {
                prompt_id: prompt.id.clone(),
                user_id: prompt.user_id.clone(),
                channel: prompt.channel,
                kind: DeliveryEventKind::SideEffectFailed,
                detail: Some(detail),
            })
            .await
        {
            error!("delivery log write failed for {}: {e}", prompt.id);
        }
    }
}
