//! Prompt lifecycle: creation with in-flight dedup, optimistic state
//! transitions, parking, reclaim and expiry queries.
//!
//! Every transition is an `UPDATE … WHERE id = ? AND state = ?` — the
//! rows-affected count is the optimistic lock that keeps two dispatcher
//! workers from double-delivering the same prompt.

use super::{fmt_ts, parse_ts, Store};
use chrono::{DateTime, Duration, Utc};
use nudge_core::error::NudgeError;
use nudge_core::prompt::{
    ChannelKind, Priority, Prompt, PromptContent, PromptState, QuickReply, ResponseAction,
};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

/// A queued prompt's dispatch ordering inputs, as returned by the reclaim
/// and unpark queries.
#[derive(Debug, Clone)]
pub struct QueueCandidate {
    pub id: String,
    pub priority: Priority,
    pub retry_count: u32,
}

/// What happened to a prompt after a failed delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDisposition {
    /// Back in the queue; not attempted again before `next_attempt`.
    Retry { next_attempt: DateTime<Utc> },
    /// Retries exhausted; terminally failed.
    Failed,
    /// The prompt left the delivering state concurrently (e.g. cancelled);
    /// nothing was changed.
    Superseded,
}

impl Store {
    /// Persist a freshly assembled prompt.
    ///
    /// Returns `false` when the in-flight dedup index rejects it: another
    /// prompt for the same `(user, timing_type, subject)` tuple is already
    /// pending, queued, or delivering.
    pub async fn create_prompt(&self, p: &Prompt) -> Result<bool, NudgeError> {
        let quick_replies = serde_json::to_string(&p.content.quick_replies)?;
        let metadata = serde_json::to_string(&p.metadata)?;

        let res = sqlx::query(
            "INSERT INTO prompts \
             (id, user_id, timing_type, priority, state, title, body, quick_replies, \
              channel, scheduled_for, delivered_at, responded_at, response_value, \
              response_action, metadata, subject_id, retry_count, next_attempt_not_before, \
              parked, expires_at, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&p.id)
        .bind(&p.user_id)
        .bind(&p.timing_type)
        .bind(p.priority.as_str())
        .bind(p.state.as_str())
        .bind(&p.content.title)
        .bind(&p.content.body)
        .bind(&quick_replies)
        .bind(p.channel.map(ChannelKind::as_str))
        .bind(p.scheduled_for.map(fmt_ts))
        .bind(p.delivered_at.map(fmt_ts))
        .bind(p.responded_at.map(fmt_ts))
        .bind(&p.response_value)
        .bind(p.response_action.as_ref().map(|a| a.as_tag().to_string()))
        .bind(&metadata)
        .bind(p.subject_id())
        .bind(i64::from(p.retry_count))
        .bind(p.next_attempt_not_before.map(fmt_ts))
        .bind(i64::from(p.parked))
        .bind(fmt_ts(p.expires_at))
        .bind(fmt_ts(p.created_at))
        .execute(&self.pool)
        .await;

        match res {
            Ok(_) => Ok(true),
            Err(sqlx::Error::Database(db))
                if db.message().contains("UNIQUE constraint failed") =>
            {
                tracing::debug!(
                    "prompt dedup: {} already in flight for user {} (subject '{}')",
                    p.timing_type,
                    p.user_id,
                    p.subject_id()
                );
                Ok(false)
            }
            Err(e) => Err(NudgeError::Store(format!("create prompt failed: {e}"))),
        }
    }

    /// Fetch a prompt by id.
    pub async fn get_prompt(&self, id: &str) -> Result<Option<Prompt>, NudgeError> {
        let row = sqlx::query("SELECT * FROM prompts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| NudgeError::Store(format!("get prompt failed: {e}")))?;

        row.map(|r| prompt_from_row(&r)).transpose()
    }

    /// `PENDING → QUEUED`.
    pub async fn mark_queued(&self, id: &str) -> Result<bool, NudgeError> {
        let res = sqlx::query("UPDATE prompts SET state = 'queued' WHERE id = ? AND state = 'pending'")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| NudgeError::Store(format!("mark queued failed: {e}")))?;
        Ok(res.rows_affected() > 0)
    }

    /// `QUEUED → DELIVERING`. Fails (returns `false`) when the prompt was
    /// cancelled, expired, parked, or claimed by another worker.
    pub async fn begin_delivery(&self, id: &str) -> Result<bool, NudgeError> {
        let res = sqlx::query(
            "UPDATE prompts SET state = 'delivering' \
             WHERE id = ? AND state = 'queued' AND parked = 0",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| NudgeError::Store(format!("begin delivery failed: {e}")))?;
        Ok(res.rows_affected() > 0)
    }

    /// `DELIVERING → DELIVERED`, recording the channel and timestamp. The
    /// channel is set exactly once, here.
    pub async fn mark_delivered(&self, id: &str, channel: ChannelKind) -> Result<bool, NudgeError> {
        let res = sqlx::query(
            "UPDATE prompts SET state = 'delivered', channel = ?, delivered_at = ? \
             WHERE id = ? AND state = 'delivering'",
        )
        .bind(channel.as_str())
        .bind(fmt_ts(Utc::now()))
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| NudgeError::Store(format!("mark delivered failed: {e}")))?;
        Ok(res.rows_affected() > 0)
    }

    /// Record a failed delivery attempt: `DELIVERING → QUEUED` with
    /// exponential backoff while retries remain, `DELIVERING → FAILED`
    /// once they are exhausted.
    pub async fn requeue_after_failure(
        &self,
        id: &str,
        error: &str,
        max_retries: u32,
        base_backoff_secs: u64,
    ) -> Result<RetryDisposition, NudgeError> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT retry_count FROM prompts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| NudgeError::Store(format!("requeue fetch failed: {e}")))?;

        let Some((current,)) = row else {
            return Ok(RetryDisposition::Superseded);
        };
        let new_count = current as u32 + 1;

        if new_count < max_retries {
            let backoff_secs = base_backoff_secs
                .saturating_mul(2u64.saturating_pow(new_count.min(10)))
                .min(3600);
            let next_attempt = Utc::now() + Duration::seconds(backoff_secs as i64);
            let res = sqlx::query(
                "UPDATE prompts SET state = 'queued', retry_count = ?, last_error = ?, \
                     next_attempt_not_before = ? \
                 WHERE id = ? AND state = 'delivering'",
            )
            .bind(i64::from(new_count))
            .bind(error)
            .bind(fmt_ts(next_attempt))
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| NudgeError::Store(format!("requeue update failed: {e}")))?;

            if res.rows_affected() == 0 {
                return Ok(RetryDisposition::Superseded);
            }
            Ok(RetryDisposition::Retry { next_attempt })
        } else {
            let res = sqlx::query(
                "UPDATE prompts SET state = 'failed', retry_count = ?, last_error = ? \
                 WHERE id = ? AND state = 'delivering'",
            )
            .bind(i64::from(new_count))
            .bind(error)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| NudgeError::Store(format!("final failure update failed: {e}")))?;

            if res.rows_affected() == 0 {
                return Ok(RetryDisposition::Superseded);
            }
            Ok(RetryDisposition::Failed)
        }
    }

    /// `DELIVERED → RESPONDED`, recording the reply. The CAS doubles as
    /// the idempotency guard: only the first reply wins.
    pub async fn mark_responded(
        &self,
        id: &str,
        value: &str,
        action: &ResponseAction,
    ) -> Result<bool, NudgeError> {
        let res = sqlx::query(
            "UPDATE prompts SET state = 'responded', response_value = ?, \
                 response_action = ?, responded_at = ? \
             WHERE id = ? AND state = 'delivered'",
        )
        .bind(value)
        .bind(action.as_tag())
        .bind(fmt_ts(Utc::now()))
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| NudgeError::Store(format!("mark responded failed: {e}")))?;
        Ok(res.rows_affected() > 0)
    }

    /// Park a queued prompt until the user has a live connection again.
    /// Parked prompts are skipped by the reclaim query and burn no retries.
    pub async fn park(&self, id: &str) -> Result<bool, NudgeError> {
        let res = sqlx::query(
            "UPDATE prompts SET parked = 1 WHERE id = ? AND state = 'queued' AND parked = 0",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| NudgeError::Store(format!("park failed: {e}")))?;
        Ok(res.rows_affected() > 0)
    }

    /// Unpark every parked prompt for a user (a connection just arrived)
    /// and return them for re-enqueueing.
    pub async fn unpark_for_user(&self, user_id: &str) -> Result<Vec<QueueCandidate>, NudgeError> {
        let rows: Vec<(String, String, i64)> = sqlx::query_as(
            "SELECT id, priority, retry_count FROM prompts \
             WHERE user_id = ? AND state = 'queued' AND parked = 1",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| NudgeError::Store(format!("unpark select failed: {e}")))?;

        if rows.is_empty() {
            return Ok(Vec::new());
        }

        sqlx::query(
            "UPDATE prompts SET parked = 0 \
             WHERE user_id = ? AND state = 'queued' AND parked = 1",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await
        .map_err(|e| NudgeError::Store(format!("unpark update failed: {e}")))?;

        Ok(rows
            .into_iter()
            .map(|(id, priority, retry_count)| QueueCandidate {
                id,
                priority: Priority::parse(&priority).unwrap_or(Priority::Low),
                retry_count: retry_count as u32,
            })
            .collect())
    }

    /// Queued, unparked prompts whose backoff (or schedule) has elapsed —
    /// the reclaim loop pushes these back into the in-memory queue. Also
    /// how in-flight work survives a process restart.
    pub async fn due_for_dispatch(&self, limit: i64) -> Result<Vec<QueueCandidate>, NudgeError> {
        let rows: Vec<(String, String, i64)> = sqlx::query_as(
            "SELECT id, priority, retry_count FROM prompts \
             WHERE state = 'queued' AND parked = 0 \
               AND (next_attempt_not_before IS NULL \
                    OR datetime(next_attempt_not_before) <= datetime('now')) \
             ORDER BY datetime(created_at) ASC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| NudgeError::Store(format!("due query failed: {e}")))?;

        Ok(rows
            .into_iter()
            .map(|(id, priority, retry_count)| QueueCandidate {
                id,
                priority: Priority::parse(&priority).unwrap_or(Priority::Low),
                retry_count: retry_count as u32,
            })
            .collect())
    }

    /// Expire every pending/queued prompt past its TTL. Returns the number
    /// of prompts expired. Expiry is a state, not a deletion.
    pub async fn expire_overdue(&self) -> Result<u64, NudgeError> {
        let res = sqlx::query(
            "UPDATE prompts SET state = 'expired' \
             WHERE state IN ('pending', 'queued') AND datetime(expires_at) <= datetime('now')",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| NudgeError::Store(format!("expiry sweep failed: {e}")))?;
        Ok(res.rows_affected())
    }

    /// Externally cancel a prompt (e.g. its triggering habit was deleted).
    /// Only undelivered prompts can be cancelled; workers observe the state
    /// change on their pre-attempt re-read.
    pub async fn cancel_prompt(&self, id: &str) -> Result<bool, NudgeError> {
        let res = sqlx::query(
            "UPDATE prompts SET state = 'expired' \
             WHERE id = ? AND state IN ('pending', 'queued')",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| NudgeError::Store(format!("cancel failed: {e}")))?;
        Ok(res.rows_affected() > 0)
    }

    /// Delivered prompts the user has not yet replied to, oldest first.
    /// Served to reconnecting clients so nothing is lost across drops.
    pub async fn unacknowledged_for_user(&self, user_id: &str) -> Result<Vec<Prompt>, NudgeError> {
        let rows = sqlx::query(
            "SELECT * FROM prompts WHERE user_id = ? AND state = 'delivered' \
             ORDER BY datetime(delivered_at) ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| NudgeError::Store(format!("unacknowledged query failed: {e}")))?;

        rows.iter().map(prompt_from_row).collect()
    }
}

fn prompt_from_row(row: &SqliteRow) -> Result<Prompt, NudgeError> {
    let get_err = |e: sqlx::Error| NudgeError::Store(format!("prompt row decode failed: {e}"));

    let state_raw: String = row.try_get("state").map_err(get_err)?;
    let priority_raw: String = row.try_get("priority").map_err(get_err)?;
    let quick_replies_raw: String = row.try_get("quick_replies").map_err(get_err)?;
    let metadata_raw: String = row.try_get("metadata").map_err(get_err)?;
    let channel_raw: Option<String> = row.try_get("channel").map_err(get_err)?;
    let response_action_raw: Option<String> = row.try_get("response_action").map_err(get_err)?;

    let quick_replies: Vec<QuickReply> = serde_json::from_str(&quick_replies_raw)?;
    let metadata: serde_json::Value = serde_json::from_str(&metadata_raw)?;

    let opt_ts = |col: &str| -> Result<Option<DateTime<Utc>>, NudgeError> {
        let raw: Option<String> = row.try_get(col).map_err(get_err)?;
        Ok(raw.as_deref().and_then(parse_ts))
    };

    let expires_raw: String = row.try_get("expires_at").map_err(get_err)?;
    let created_raw: String = row.try_get("created_at").map_err(get_err)?;
    let retry_count: i64 = row.try_get("retry_count").map_err(get_err)?;
    let parked: i64 = row.try_get("parked").map_err(get_err)?;

    Ok(Prompt {
        id: row.try_get("id").map_err(get_err)?,
        user_id: row.try_get("user_id").map_err(get_err)?,
        timing_type: row.try_get("timing_type").map_err(get_err)?,
        priority: Priority::parse(&priority_raw)
            .ok_or_else(|| NudgeError::Store(format!("unknown priority '{priority_raw}'")))?,
        state: PromptState::parse(&state_raw)
            .ok_or_else(|| NudgeError::Store(format!("unknown state '{state_raw}'")))?,
        content: PromptContent {
            title: row.try_get("title").map_err(get_err)?,
            body: row.try_get("body").map_err(get_err)?,
            quick_replies,
        },
        channel: channel_raw.as_deref().and_then(ChannelKind::parse),
        scheduled_for: opt_ts("scheduled_for")?,
        delivered_at: opt_ts("delivered_at")?,
        responded_at: opt_ts("responded_at")?,
        response_value: row.try_get("response_value").map_err(get_err)?,
        response_action: response_action_raw
            .as_deref()
            .map(ResponseAction::from_tag),
        metadata,
        retry_count: retry_count as u32,
        next_attempt_not_before: opt_ts("next_attempt_not_before")?,
        parked: parked != 0,
        expires_at: parse_ts(&expires_raw)
            .ok_or_else(|| NudgeError::Store(format!("bad expires_at '{expires_raw}'")))?,
        created_at: parse_ts(&created_raw)
            .ok_or_else(|| NudgeError::Store(format!("bad created_at '{created_raw}'")))?,
    })
}
