//! Read-only user-state views for the timing detector. The host app
//! maintains `user_activity` and `habit_status`; a `user_activity` row is
//! what marks a user as active for detection.

use super::{parse_ts, Store};
use async_trait::async_trait;
use chrono::NaiveTime;
use nudge_core::error::NudgeError;
use nudge_core::snapshot::{HabitStatus, UserSnapshot};
use nudge_core::traits::UserStateSource;

impl Store {
    async fn fetch_snapshot(&self, user_id: &str) -> Result<UserSnapshot, NudgeError> {
        #[allow(clippy::type_complexity)]
        let row: Option<(Option<String>, Option<String>, Option<String>, Option<String>)> =
            sqlx::query_as(
                "SELECT last_conversation_at, active_start, active_end, last_progress_at \
                 FROM user_activity WHERE user_id = ?",
            )
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| NudgeError::Store(format!("activity query failed: {e}")))?;

        let Some((last_conversation, active_start, active_end, last_progress)) = row else {
            return Ok(UserSnapshot::empty(user_id));
        };

        let habits: Vec<(String, String, Option<String>)> = sqlx::query_as(
            "SELECT habit_id, name, last_completed_at FROM habit_status \
             WHERE user_id = ? ORDER BY habit_id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| NudgeError::Store(format!("habit query failed: {e}")))?;

        Ok(UserSnapshot {
            user_id: user_id.to_string(),
            last_conversation_at: last_conversation.as_deref().and_then(parse_ts),
            active_start: active_start.as_deref().and_then(parse_hhmm),
            active_end: active_end.as_deref().and_then(parse_hhmm),
            last_progress_at: last_progress.as_deref().and_then(parse_ts),
            habits: habits
                .into_iter()
                .map(|(habit_id, name, completed)| HabitStatus {
                    habit_id,
                    name,
                    last_completed_at: completed.as_deref().and_then(parse_ts),
                })
                .collect(),
        })
    }
}

#[async_trait]
impl UserStateSource for Store {
    async fn active_users(&self) -> Result<Vec<String>, NudgeError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT user_id FROM user_activity ORDER BY user_id")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| NudgeError::Store(format!("active users query failed: {e}")))?;
        Ok(rows.into_iter().map(|(u,)| u).collect())
    }

    async fn snapshot(&self, user_id: &str) -> Result<UserSnapshot, NudgeError> {
        self.fetch_snapshot(user_id).await
    }
}

fn parse_hhmm(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M").ok()
}
