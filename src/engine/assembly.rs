//! Prompt assembly: synthesize content for an admitted timing, persist the
//! prompt, and hand it to the dispatcher.
//!
//! Synthesis failures are terminal for the prompt — it is persisted as
//! FAILED with no delivery attempt, so a flaky synthesizer costs one
//! cycle's notification, never a blocked pipeline.

use super::queue::{effective_rank, DeliveryQueue};
use chrono::{DateTime, Duration, Utc};
use nudge_core::{
    config::Config,
    error::NudgeError,
    prompt::Prompt,
    snapshot::UserSnapshot,
    timing::PromptTiming,
    traits::ContentSynthesizer,
};
use nudge_store::{DeliveryEvent, DeliveryEventKind, DeliveryLog, Store};
use tracing::{debug, info, warn};

/// Synthesize, persist, and enqueue one prompt for an admitted timing.
///
/// Returns the new prompt id, or `None` when the prompt was dropped
/// (duplicate in flight) or terminally failed at synthesis.
#[allow(clippy::too_many_arguments)]
pub(super) async fn assemble_and_enqueue(
    store: &Store,
    synthesizer: &dyn ContentSynthesizer,
    queue: &DeliveryQueue,
    log: &DeliveryLog,
    config: &Config,
    timing: &PromptTiming,
    snapshot: &UserSnapshot,
    scheduled_for: DateTime<Utc>,
) -> Result<Option<String>, NudgeError> {
    let synthesis_timeout = std::time::Duration::from_secs(config.synthesis.timeout_secs);

    let synthesized = match tokio::time::timeout(
        synthesis_timeout,
        synthesizer.synthesize(timing, snapshot),
    )
    .await
    {
        Ok(Ok(synthesized)) => synthesized,
        Ok(Err(e)) => return fail_synthesis(store, log, config, timing, e.to_string()).await,
        Err(_) => {
            let detail = format!(
                "synthesis timed out after {}s",
                config.synthesis.timeout_secs
            );
            return fail_synthesis(store, log, config, timing, detail).await;
        }
    };

    let ttl = synthesized
        .ttl_seconds
        .map(Duration::seconds)
        .unwrap_or_else(|| Duration::hours(config.dispatcher.prompt_ttl_hours));
    let prompt = Prompt::from_timing(timing, synthesized.content, scheduled_for, scheduled_for + ttl);

    if !store.create_prompt(&prompt).await? {
        // An equivalent prompt is already in flight; the dedup invariant
        // wins and this candidate is dropped.
        return Ok(None);
    }

    if store.mark_queued(&prompt.id).await? {
        log.log(&DeliveryEvent {
            prompt_id: prompt.id.clone(),
            user_id: prompt.user_id.clone(),
            channel: None,
            kind: DeliveryEventKind::Queued,
            detail: None,
        })
        .await?;

        // Future-scheduled prompts (follow-ups) wait for the reclaim loop;
        // everything else goes straight to the workers.
        if scheduled_for <= Utc::now() {
            queue.push(&prompt.id, effective_rank(prompt.priority, 0));
        }

        info!(
            "assembled prompt {} ({}) for user {}",
            prompt.id, prompt.timing_type, prompt.user_id
        );
    }

    Ok(Some(prompt.id))
}

/// Persist a terminally-failed prompt for a timing whose synthesis failed.
async fn fail_synthesis(
    store: &Store,
    log: &DeliveryLog,
    config: &Config,
    timing: &PromptTiming,
    detail: String,
) -> Result<Option<String>, NudgeError> {
    warn!(
        "synthesis failed for {} (user {}): {detail}",
        timing.kind, timing.user_id
    );

    let expires_at = Utc::now() + Duration::hours(config.dispatcher.prompt_ttl_hours);
    let prompt = Prompt::failed_synthesis(timing, expires_at);
    if store.create_prompt(&prompt).await? {
        log.log(&DeliveryEvent {
            prompt_id: prompt.id.clone(),
            user_id: prompt.user_id.clone(),
            channel: None,
            kind: DeliveryEventKind::SynthesisFailed,
            detail: Some(detail),
        })
        .await?;
    } else {
        debug!(
            "synthesis-failure record for {} dropped (duplicate in flight)",
            timing.kind
        );
    }
    Ok(None)
}
