//! Per-user state snapshots the detector rules evaluate over.
//!
//! Snapshots are fetched through the `UserStateSource` seam; the detector
//! itself is a stateless function over them.

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

/// Current status of one tracked habit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HabitStatus {
    pub habit_id: String,
    pub name: String,
    pub last_completed_at: Option<DateTime<Utc>>,
}

/// Compact view of a user's recent activity, maintained by the host
/// application and read-only to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSnapshot {
    pub user_id: String,
    pub last_conversation_at: Option<DateTime<Utc>>,
    /// Start of the user's historical active window, if known.
    pub active_start: Option<NaiveTime>,
    /// End of the user's historical active window, if known.
    pub active_end: Option<NaiveTime>,
    pub last_progress_at: Option<DateTime<Utc>>,
    pub habits: Vec<HabitStatus>,
}

impl UserSnapshot {
    /// An empty snapshot for a user the host app has no signals for.
    pub fn empty(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            last_conversation_at: None,
            active_start: None,
            active_end: None,
            last_progress_at: None,
            habits: Vec::new(),
        }
    }
}
