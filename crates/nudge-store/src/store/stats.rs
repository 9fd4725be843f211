//! Delivery statistics feeding the frequency controller.

use super::{parse_ts, Store};
use chrono::{DateTime, Utc};
use nudge_core::error::NudgeError;

impl Store {
    /// Prompts that count against the daily cap: delivered within the last
    /// rolling 24 hours, plus everything currently in flight.
    pub async fn prompt_load_today(&self, user_id: &str) -> Result<i64, NudgeError> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM prompts \
             WHERE user_id = ? \
               AND ((delivered_at IS NOT NULL \
                     AND datetime(delivered_at) >= datetime('now', '-24 hours')) \
                    OR state IN ('pending', 'queued', 'delivering'))",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| NudgeError::Store(format!("daily load query failed: {e}")))?;
        Ok(count)
    }

    /// Timestamp of the user's most recent delivery.
    pub async fn last_delivered_at(
        &self,
        user_id: &str,
    ) -> Result<Option<DateTime<Utc>>, NudgeError> {
        let (raw,): (Option<String>,) = sqlx::query_as(
            "SELECT MAX(delivered_at) FROM prompts \
             WHERE user_id = ? AND delivered_at IS NOT NULL",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| NudgeError::Store(format!("last delivery query failed: {e}")))?;
        Ok(raw.as_deref().and_then(parse_ts))
    }

    /// `(delivered, responded)` over the user's trailing `window` delivered
    /// prompts — the engagement throttle's input.
    pub async fn response_counts(
        &self,
        user_id: &str,
        window: u32,
    ) -> Result<(i64, i64), NudgeError> {
        let (delivered, responded): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), \
                    COALESCE(SUM(CASE WHEN state = 'responded' THEN 1 ELSE 0 END), 0) \
             FROM (SELECT state FROM prompts \
                   WHERE user_id = ? AND delivered_at IS NOT NULL \
                   ORDER BY datetime(delivered_at) DESC LIMIT ?)",
        )
        .bind(user_id)
        .bind(i64::from(window))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| NudgeError::Store(format!("response rate query failed: {e}")))?;
        Ok((delivered, responded))
    }

    /// When this timing type last produced a prompt for the user. Failed
    /// synthesis attempts don't count — the user never saw anything.
    pub async fn last_of_type_at(
        &self,
        user_id: &str,
        timing_type: &str,
    ) -> Result<Option<DateTime<Utc>>, NudgeError> {
        let (raw,): (Option<String>,) = sqlx::query_as(
            "SELECT MAX(created_at) FROM prompts \
             WHERE user_id = ? AND timing_type = ? AND state != 'failed'",
        )
        .bind(user_id)
        .bind(timing_type)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| NudgeError::Store(format!("recurrence query failed: {e}")))?;
        Ok(raw.as_deref().and_then(parse_ts))
    }
}
