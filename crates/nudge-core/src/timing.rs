//! Candidate prompt timings — ephemeral, never persisted.

use serde::{Deserialize, Serialize};

use crate::prompt::Priority;

/// Rule-based timing kinds the detector ships with. Heuristic detectors
/// may emit kinds outside this list; the pipeline treats kinds as open.
pub const TIMING_DAILY_CHECKIN: &str = "daily_checkin";
pub const TIMING_HABIT_MISSED: &str = "habit_missed";
pub const TIMING_PROGRESS_STALLED: &str = "progress_stalled";

/// A candidate reason/moment to notify a user. Produced by the timing
/// detector, consumed immediately by the frequency controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptTiming {
    pub kind: String,
    pub user_id: String,
    pub priority: Priority,
    /// Detector confidence in [0, 1].
    pub confidence: f32,
    /// Detector-specific context, carried through to the response handler.
    /// `metadata.subject_id` participates in the in-flight dedup invariant.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Merge rule-based and heuristic candidates for one user.
///
/// Deduplicates by kind (keeping the highest priority, then the highest
/// confidence) and truncates to the top `max` by priority then confidence.
pub fn merge_candidates(candidates: Vec<PromptTiming>, max: usize) -> Vec<PromptTiming> {
    let mut merged: Vec<PromptTiming> = Vec::with_capacity(candidates.len());

    for cand in candidates {
        match merged.iter().position(|t| t.kind == cand.kind) {
            Some(i) => {
                let existing = &merged[i];
                let better_priority = cand.priority.rank() < existing.priority.rank();
                let same_priority_more_confident = cand.priority.rank()
                    == existing.priority.rank()
                    && cand.confidence > existing.confidence;
                if better_priority || same_priority_more_confident {
                    merged[i] = cand;
                }
            }
            None => merged.push(cand),
        }
    }

    merged.sort_by(|a, b| {
        a.priority
            .rank()
            .cmp(&b.priority.rank())
            .then(b.confidence.total_cmp(&a.confidence))
    });
    merged.truncate(max);
    merged
}
