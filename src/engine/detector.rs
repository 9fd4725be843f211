//! Timing detector — the proactive side of the engine.
//!
//! A fixed-cadence scan over the active users. For each user the rule
//! predicates run over an externally-fetched snapshot, the optional
//! heuristic detector contributes extra candidates, and the merged top
//! candidates flow through the admission gate into prompt assembly.
//! One user's failure never aborts the batch.

use super::{admission, assembly, queue::DeliveryQueue, Engine};
use chrono::{DateTime, Utc};
use nudge_core::{
    config::Config,
    error::NudgeError,
    preferences::time_in_window,
    prompt::Priority,
    snapshot::UserSnapshot,
    timing::{
        merge_candidates, PromptTiming, TIMING_DAILY_CHECKIN, TIMING_HABIT_MISSED,
        TIMING_PROGRESS_STALLED,
    },
    traits::{ContentSynthesizer, TimingHeuristic, UserStateSource},
};
use nudge_store::{DeliveryLog, Store};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

impl Engine {
    /// Background task: periodic detection cycle over all active users.
    #[allow(clippy::too_many_arguments)]
    pub(super) async fn detector_loop(
        source: Arc<dyn UserStateSource>,
        store: Store,
        heuristic: Option<Arc<dyn TimingHeuristic>>,
        synthesizer: Arc<dyn ContentSynthesizer>,
        queue: Arc<DeliveryQueue>,
        log: DeliveryLog,
        config: Config,
    ) {
        let poll = std::time::Duration::from_secs(config.detector.poll_interval_secs);
        loop {
            tokio::time::sleep(poll).await;

            let users = match source.active_users().await {
                Ok(users) => users,
                Err(e) => {
                    error!("detector: failed to list active users: {e}");
                    continue;
                }
            };

            let mut admitted = 0usize;
            for user_id in &users {
                match detect_for_user(
                    &*source,
                    &store,
                    heuristic.as_deref(),
                    &*synthesizer,
                    &queue,
                    &log,
                    &config,
                    user_id,
                )
                .await
                {
                    Ok(count) => admitted += count,
                    // Skip-and-log: one user never takes down the cycle.
                    Err(e) => warn!("detector: user {user_id} failed: {e}"),
                }
            }

            if admitted > 0 {
                info!(
                    "detector: cycle over {} users admitted {} prompts",
                    users.len(),
                    admitted
                );
            } else {
                debug!("detector: cycle over {} users, nothing admitted", users.len());
            }
        }
    }
}

/// Run detection for one user. Returns how many prompts were admitted and
/// assembled.
#[allow(clippy::too_many_arguments)]
async fn detect_for_user(
    source: &dyn UserStateSource,
    store: &Store,
    heuristic: Option<&dyn TimingHeuristic>,
    synthesizer: &dyn ContentSynthesizer,
    queue: &DeliveryQueue,
    log: &DeliveryLog,
    config: &Config,
    user_id: &str,
) -> Result<usize, NudgeError> {
    let snapshot = source.snapshot(user_id).await?;
    let now = Utc::now();

    let mut candidates = rule_candidates(&snapshot, now);

    if let Some(heuristic) = heuristic {
        match heuristic.detect(&snapshot).await {
            Ok(mut extra) => candidates.append(&mut extra),
            // Heuristic failure yields no candidates; rules still count.
            Err(e) => warn!("detector: heuristic failed for {user_id}: {e}"),
        }
    }

    let candidates = merge_candidates(candidates, config.detector.max_candidates);
    if candidates.is_empty() {
        return Ok(0);
    }

    let prefs = store
        .preferences(user_id)
        .await?
        .unwrap_or_else(|| config.frequency.default_preferences());

    let mut admitted = 0usize;
    for timing in candidates {
        let stats = admission::gather_stats(store, user_id, &timing.kind, &config.frequency).await?;
        match admission::admit(&timing, &prefs, &stats, &config.frequency, Utc::now()) {
            Ok(()) => {
                match assembly::assemble_and_enqueue(
                    store,
                    synthesizer,
                    queue,
                    log,
                    config,
                    &timing,
                    &snapshot,
                    Utc::now(),
                )
                .await
                {
                    Ok(Some(_)) => admitted += 1,
                    Ok(None) => {}
                    // Per-prompt isolation: an assembly failure must not
                    // drop this user's remaining candidates.
                    Err(e) => warn!("detector: assembly failed for {user_id}: {e}"),
                }
            }
            Err(reason) => {
                debug!(
                    "detector: rejected {} for {user_id}: {}",
                    timing.kind,
                    reason.as_str()
                );
            }
        }
    }

    Ok(admitted)
}

/// Rule predicates, evaluated independently over the snapshot.
pub(super) fn rule_candidates(snapshot: &UserSnapshot, now: DateTime<Utc>) -> Vec<PromptTiming> {
    let mut candidates = Vec::new();

    // No conversation today, and the current time falls in the user's
    // historical active window (unknown window = always in window).
    let conversed_today = snapshot
        .last_conversation_at
        .map(|t| t.date_naive() == now.date_naive())
        .unwrap_or(false);
    let in_active_window = match (snapshot.active_start, snapshot.active_end) {
        (Some(start), Some(end)) => time_in_window(start, end, now.time()),
        _ => true,
    };
    if !conversed_today && in_active_window {
        candidates.push(PromptTiming {
            kind: TIMING_DAILY_CHECKIN.into(),
            user_id: snapshot.user_id.clone(),
            priority: Priority::Medium,
            confidence: 0.9,
            metadata: json!({}),
        });
    }

    // A tracked habit with zero completions for two or more days.
    for habit in &snapshot.habits {
        let Some(completed_at) = habit.last_completed_at else {
            // Never-completed habits have no streak to protect.
            continue;
        };
        let days_missed = (now - completed_at).num_days();
        if days_missed >= 2 {
            candidates.push(PromptTiming {
                kind: TIMING_HABIT_MISSED.into(),
                user_id: snapshot.user_id.clone(),
                priority: if days_missed >= 4 {
                    Priority::High
                } else {
                    Priority::Medium
                },
                confidence: (0.5 + 0.1 * days_missed as f32).min(0.95),
                metadata: json!({
                    "subject_id": habit.habit_id,
                    "habit_id": habit.habit_id,
                    "habit_name": habit.name,
                    "days_missed": days_missed,
                }),
            });
        }
    }

    // No measurable progress for three or more days.
    if let Some(progress_at) = snapshot.last_progress_at {
        let days_stalled = (now - progress_at).num_days();
        if days_stalled >= 3 {
            candidates.push(PromptTiming {
                kind: TIMING_PROGRESS_STALLED.into(),
                user_id: snapshot.user_id.clone(),
                priority: Priority::Low,
                confidence: 0.6,
                metadata: json!({"days_stalled": days_stalled}),
            });
        }
    }

    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveTime, TimeZone};
    use nudge_core::snapshot::HabitStatus;

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 7, 12, 0, 0).unwrap()
    }

    fn base_snapshot() -> UserSnapshot {
        UserSnapshot {
            user_id: "u1".into(),
            // Conversed today: the check-in rule stays quiet by default.
            last_conversation_at: Some(noon() - Duration::hours(1)),
            active_start: None,
            active_end: None,
            last_progress_at: Some(noon() - Duration::hours(12)),
            habits: Vec::new(),
        }
    }

    #[test]
    fn test_checkin_fires_without_conversation_today() {
        let mut snap = base_snapshot();
        snap.last_conversation_at = Some(noon() - Duration::days(1));
        let candidates = rule_candidates(&snap, noon());
        assert!(candidates.iter().any(|t| t.kind == TIMING_DAILY_CHECKIN));
    }

    #[test]
    fn test_checkin_respects_active_window() {
        let mut snap = base_snapshot();
        snap.last_conversation_at = None;
        snap.active_start = NaiveTime::from_hms_opt(18, 0, 0);
        snap.active_end = NaiveTime::from_hms_opt(22, 0, 0);
        // Noon is outside the user's 18:00-22:00 window.
        let candidates = rule_candidates(&snap, noon());
        assert!(!candidates.iter().any(|t| t.kind == TIMING_DAILY_CHECKIN));
    }

    #[test]
    fn test_habit_missed_thresholds() {
        let mut snap = base_snapshot();
        snap.habits = vec![
            HabitStatus {
                habit_id: "fresh".into(),
                name: "Stretch".into(),
                last_completed_at: Some(noon() - Duration::days(1)),
            },
            HabitStatus {
                habit_id: "missed".into(),
                name: "Walk".into(),
                last_completed_at: Some(noon() - Duration::days(2)),
            },
            HabitStatus {
                habit_id: "long-missed".into(),
                name: "Meditate".into(),
                last_completed_at: Some(noon() - Duration::days(5)),
            },
            HabitStatus {
                habit_id: "never".into(),
                name: "Journal".into(),
                last_completed_at: None,
            },
        ];

        let candidates = rule_candidates(&snap, noon());
        let missed: Vec<_> = candidates
            .iter()
            .filter(|t| t.kind == TIMING_HABIT_MISSED)
            .collect();
        assert_eq!(missed.len(), 2);

        let two_days = missed
            .iter()
            .find(|t| subject_id(t) == Some("missed"))
            .unwrap();
        assert_eq!(two_days.priority, Priority::Medium);
        let five_days = missed
            .iter()
            .find(|t| subject_id(t) == Some("long-missed"))
            .unwrap();
        assert_eq!(five_days.priority, Priority::High);
        assert!(five_days.confidence > two_days.confidence);
    }

    #[test]
    fn test_progress_stalled_after_three_days() {
        let mut snap = base_snapshot();
        snap.last_progress_at = Some(noon() - Duration::days(4));
        let candidates = rule_candidates(&snap, noon());
        let stalled = candidates
            .iter()
            .find(|t| t.kind == TIMING_PROGRESS_STALLED)
            .unwrap();
        assert_eq!(stalled.priority, Priority::Low);
    }

    #[test]
    fn test_quiet_user_day_produces_nothing() {
        let candidates = rule_candidates(&base_snapshot(), noon());
        assert!(candidates.is_empty());
    }

    fn subject_id(timing: &PromptTiming) -> Option<&str> {
        timing
            .metadata
            .get("subject_id")
            .and_then(serde_json::Value::as_str)
    }
}
