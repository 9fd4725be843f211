//! Delivery log — the per-attempt trail behind every prompt.

use nudge_core::error::NudgeError;
use nudge_core::prompt::ChannelKind;
use sqlx::SqlitePool;
use tracing::debug;
use uuid::Uuid;

/// What happened to a prompt at one point in its life.
pub enum DeliveryEventKind {
    Queued,
    Delivered,
    DeliveryFailed,
    Parked,
    Responded,
    ReplyRejected,
    SynthesisFailed,
    SideEffectFailed,
}

impl DeliveryEventKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Delivered => "delivered",
            Self::DeliveryFailed => "delivery_failed",
            Self::Parked => "parked",
            Self::Responded => "responded",
            Self::ReplyRejected => "reply_rejected",
            Self::SynthesisFailed => "synthesis_failed",
            Self::SideEffectFailed => "side_effect_failed",
        }
    }
}

/// An entry to write to the delivery log.
pub struct DeliveryEvent {
    pub prompt_id: String,
    pub user_id: String,
    pub channel: Option<ChannelKind>,
    pub kind: DeliveryEventKind,
    pub detail: Option<String>,
}

/// Delivery logger backed by SQLite.
#[derive(Clone)]
pub struct DeliveryLog {
    pool: SqlitePool,
}

impl DeliveryLog {
    /// Create a new delivery logger sharing the given pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Write an entry to the delivery log.
    pub async fn log(&self, entry: &DeliveryEvent) -> Result<(), NudgeError> {
        let id = Uuid::new_v4().to_string();

        sqlx::query(
            "INSERT INTO delivery_log (id, prompt_id, user_id, channel, event, detail) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&entry.prompt_id)
        .bind(&entry.user_id)
        .bind(entry.channel.map(ChannelKind::as_str))
        .bind(entry.kind.as_str())
        .bind(&entry.detail)
        .execute(&self.pool)
        .await
        .map_err(|e| NudgeError::Store(format!("delivery log write failed: {e}")))?;

        debug!(
            "delivery_log: {} {} [{}]",
            entry.user_id,
            entry.prompt_id,
            entry.kind.as_str()
        );

        Ok(())
    }
}
