//! Read-only access to per-user notification preferences. The host
//! application owns these rows; the engine never writes them.

use super::Store;
use chrono::NaiveTime;
use nudge_core::error::NudgeError;
use nudge_core::preferences::{ChannelOptIns, NotificationPreferences, QuietHours};

impl Store {
    /// Fetch a user's preference record, or `None` when the host app has
    /// not stored one (callers fall back to configured defaults).
    pub async fn preferences(
        &self,
        user_id: &str,
    ) -> Result<Option<NotificationPreferences>, NudgeError> {
        #[allow(clippy::type_complexity)]
        let row: Option<(i64, i64, i64, String, String, i64, i64, i64, String)> = sqlx::query_as(
            "SELECT daily_max, min_interval_minutes, quiet_enabled, quiet_start, quiet_end, \
                    in_app, push, email, enabled_types \
             FROM preferences WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| NudgeError::Store(format!("preferences query failed: {e}")))?;

        let Some((
            daily_max,
            min_interval,
            quiet_enabled,
            quiet_start,
            quiet_end,
            in_app,
            push,
            email,
            enabled_types,
        )) = row
        else {
            return Ok(None);
        };

        Ok(Some(NotificationPreferences {
            daily_max: daily_max.max(0) as u32,
            min_interval_minutes: min_interval.max(0) as u32,
            quiet: QuietHours {
                enabled: quiet_enabled != 0,
                start: parse_hhmm(&quiet_start)?,
                end: parse_hhmm(&quiet_end)?,
            },
            channels: ChannelOptIns {
                in_app: in_app != 0,
                push: push != 0,
                email: email != 0,
            },
            enabled_types: serde_json::from_str(&enabled_types).unwrap_or_default(),
        }))
    }
}

fn parse_hhmm(s: &str) -> Result<NaiveTime, NudgeError> {
    NaiveTime::parse_from_str(s, "%H:%M")
        .map_err(|e| NudgeError::Store(format!("invalid quiet-hours time '{s}': {e}")))
}
