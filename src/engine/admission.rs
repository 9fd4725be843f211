//! Frequency & quiet-hours controller.
//!
//! `admit` is a pure gate over `(preferences, stats, timing, now)`,
//! evaluated in a fixed order and short-circuiting on the first rejection.
//! Rejected timings are dropped silently; the next detector cycle may
//! re-emit them if conditions persist.

use chrono::{DateTime, Duration, Utc};
use nudge_core::config::FrequencyConfig;
use nudge_core::error::NudgeError;
use nudge_core::preferences::NotificationPreferences;
use nudge_core::prompt::Priority;
use nudge_core::timing::{PromptTiming, TIMING_DAILY_CHECKIN, TIMING_PROGRESS_STALLED};
use nudge_store::Store;

/// Inputs the gate needs from the store, gathered once per candidate.
#[derive(Debug, Clone, Default)]
pub(super) struct FrequencyStats {
    /// Delivered in the last 24h plus currently in flight.
    pub prompt_load: i64,
    pub last_delivered_at: Option<DateTime<Utc>>,
    /// Rolling response rate; `None` until the sample is large enough.
    pub response_rate: Option<f32>,
    pub last_of_type_at: Option<DateTime<Utc>>,
}

/// Why a timing was rejected. Logged at debug level only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum RejectReason {
    TypeDisabled,
    QuietHours,
    DailyCap,
    MinInterval,
    LowEngagement,
    TypeRecurrence,
}

impl RejectReason {
    pub(super) fn as_str(self) -> &'static str {
        match self {
            Self::TypeDisabled => "type_disabled",
            Self::QuietHours => "quiet_hours",
            Self::DailyCap => "daily_cap",
            Self::MinInterval => "min_interval",
            Self::LowEngagement => "low_engagement",
            Self::TypeRecurrence => "type_recurrence",
        }
    }
}

/// Minimum recurrence window per timing type. `daily_checkin` is bounded
/// by calendar day instead (at most one per day, whatever the hour).
fn recurrence_window_hours(kind: &str) -> i64 {
    match kind {
        TIMING_PROGRESS_STALLED => 48,
        _ => 24,
    }
}

/// The admission gate, in fixed order: disabled type → quiet hours →
/// daily cap → minimum interval → engagement throttle → per-type
/// recurrence. The daily cap is unconditional — HIGH priority does not
/// bypass it; priority only matters for the engagement throttle.
pub(super) fn admit(
    timing: &PromptTiming,
    prefs: &NotificationPreferences,
    stats: &FrequencyStats,
    config: &FrequencyConfig,
    now: DateTime<Utc>,
) -> Result<(), RejectReason> {
    if !prefs.type_enabled(&timing.kind) {
        return Err(RejectReason::TypeDisabled);
    }

    if prefs.quiet.contains(now.time()) {
        return Err(RejectReason::QuietHours);
    }

    if stats.prompt_load >= i64::from(prefs.daily_max) {
        return Err(RejectReason::DailyCap);
    }

    if let Some(last) = stats.last_delivered_at {
        if now - last < Duration::minutes(i64::from(prefs.min_interval_minutes)) {
            return Err(RejectReason::MinInterval);
        }
    }

    if let Some(rate) = stats.response_rate {
        if rate < config.engagement_threshold && timing.priority != Priority::High {
            return Err(RejectReason::LowEngagement);
        }
    }

    if let Some(last) = stats.last_of_type_at {
        let recurring_too_soon = if timing.kind == TIMING_DAILY_CHECKIN {
            last.date_naive() == now.date_naive()
        } else {
            now - last < Duration::hours(recurrence_window_hours(&timing.kind))
        };
        if recurring_too_soon {
            return Err(RejectReason::TypeRecurrence);
        }
    }

    Ok(())
}

/// Gather the gate's inputs for one `(user, timing type)` pair.
pub(super) async fn gather_stats(
    store: &Store,
    user_id: &str,
    timing_type: &str,
    config: &FrequencyConfig,
) -> Result<FrequencyStats, NudgeError> {
    let prompt_load = store.prompt_load_today(user_id).await?;
    let last_delivered_at = store.last_delivered_at(user_id).await?;
    let (delivered, responded) = store
        .response_counts(user_id, config.engagement_window)
        .await?;
    let response_rate = if delivered >= i64::from(config.engagement_min_sample) {
        Some(responded as f32 / delivered as f32)
    } else {
        None
    };
    let last_of_type_at = store.last_of_type_at(user_id, timing_type).await?;

    Ok(FrequencyStats {
        prompt_load,
        last_delivered_at,
        response_rate,
        last_of_type_at,
    })
}
