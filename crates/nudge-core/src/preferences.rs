//! Per-user notification preferences, read-only to the engine.

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

use crate::prompt::ChannelKind;

/// Do-not-disturb window. May wrap midnight (e.g. 22:00–08:00).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QuietHours {
    pub enabled: bool,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl QuietHours {
    /// Whether `now` falls inside the window. Disabled windows contain
    /// nothing.
    pub fn contains(&self, now: NaiveTime) -> bool {
        self.enabled && time_in_window(self.start, self.end, now)
    }
}

/// Wrap-aware window test: `start <= t <= end` for same-day windows,
/// `t >= start || t <= end` when the window wraps midnight.
pub fn time_in_window(start: NaiveTime, end: NaiveTime, t: NaiveTime) -> bool {
    if start <= end {
        t >= start && t <= end
    } else {
        t >= start || t <= end
    }
}

/// Per-channel opt-ins.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ChannelOptIns {
    pub in_app: bool,
    pub push: bool,
    pub email: bool,
}

impl ChannelOptIns {
    pub fn allows(&self, kind: ChannelKind) -> bool {
        match kind {
            ChannelKind::InApp => self.in_app,
            ChannelKind::Push => self.push,
            ChannelKind::Email => self.email,
        }
    }
}

impl Default for ChannelOptIns {
    fn default() -> Self {
        Self {
            in_app: true,
            push: true,
            email: true,
        }
    }
}

/// A user's notification preference record. Owned by the host application;
/// the engine only ever reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationPreferences {
    /// Ceiling on prompts per rolling 24h window, unconditional.
    pub daily_max: u32,
    /// Minimum gap between deliveries, in minutes.
    pub min_interval_minutes: u32,
    pub quiet: QuietHours,
    pub channels: ChannelOptIns,
    /// Timing kinds this user accepts. Empty means all kinds.
    pub enabled_types: Vec<String>,
}

impl NotificationPreferences {
    pub fn type_enabled(&self, kind: &str) -> bool {
        self.enabled_types.is_empty() || self.enabled_types.iter().any(|t| t == kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_quiet_hours_wrapping_window() {
        let quiet = QuietHours {
            enabled: true,
            start: t(22, 0),
            end: t(8, 0),
        };
        assert!(quiet.contains(t(23, 30)));
        assert!(quiet.contains(t(7, 0)));
        assert!(!quiet.contains(t(12, 0)));
    }

    #[test]
    fn test_quiet_hours_same_day_window() {
        let quiet = QuietHours {
            enabled: true,
            start: t(13, 0),
            end: t(15, 0),
        };
        assert!(quiet.contains(t(14, 0)));
        assert!(!quiet.contains(t(12, 59)));
        assert!(!quiet.contains(t(15, 1)));
    }

    #[test]
    fn test_quiet_hours_disabled_contains_nothing() {
        let quiet = QuietHours {
            enabled: false,
            start: t(0, 0),
            end: t(23, 59),
        };
        assert!(!quiet.contains(t(12, 0)));
    }

    #[test]
    fn test_type_enabled_empty_means_all() {
        let mut prefs = NotificationPreferences {
            daily_max: 5,
            min_interval_minutes: 90,
            quiet: QuietHours {
                enabled: false,
                start: t(22, 0),
                end: t(8, 0),
            },
            channels: ChannelOptIns::default(),
            enabled_types: Vec::new(),
        };
        assert!(prefs.type_enabled("daily_checkin"));
        prefs.enabled_types = vec!["habit_missed".into()];
        assert!(prefs.type_enabled("habit_missed"));
        assert!(!prefs.type_enabled("daily_checkin"));
    }
}
