use super::Store;
use crate::log::{DeliveryEvent, DeliveryEventKind, DeliveryLog};
use crate::store::RetryDisposition;
use chrono::{Duration, Utc};
use nudge_core::config::StoreConfig;
use nudge_core::prompt::{
    ChannelKind, Priority, Prompt, PromptContent, PromptState, QuickReply, ResponseAction,
};
use nudge_core::timing::PromptTiming;
use nudge_core::traits::UserStateSource;
use serde_json::json;

/// Create an in-memory store for testing.
async fn test_store() -> Store {
    Store::new(&StoreConfig {
        db_path: ":memory:".to_string(),
    })
    .await
    .unwrap()
}

fn timing(user: &str, kind: &str, subject: &str) -> PromptTiming {
    PromptTiming {
        kind: kind.to_string(),
        user_id: user.to_string(),
        priority: Priority::Medium,
        confidence: 0.8,
        metadata: json!({"subject_id": subject, "habit_id": subject}),
    }
}

fn content() -> PromptContent {
    PromptContent {
        title: "Quick check-in".into(),
        body: "How did your morning walk go?".into(),
        quick_replies: vec![QuickReply {
            text: "Done!".into(),
            value: "complete_now".into(),
            next_step: None,
        }],
    }
}

fn new_prompt(user: &str, kind: &str, subject: &str) -> Prompt {
    Prompt::from_timing(
        &timing(user, kind, subject),
        content(),
        Utc::now(),
        Utc::now() + Duration::hours(24),
    )
}

#[tokio::test]
async fn test_create_and_get_roundtrip() {
    let store = test_store().await;
    let p = new_prompt("u1", "habit_missed", "h1");
    assert!(store.create_prompt(&p).await.unwrap());

    let loaded = store.get_prompt(&p.id).await.unwrap().unwrap();
    assert_eq!(loaded.user_id, "u1");
    assert_eq!(loaded.timing_type, "habit_missed");
    assert_eq!(loaded.state, PromptState::Pending);
    assert_eq!(loaded.subject_id(), "h1");
    assert_eq!(loaded.content.quick_replies.len(), 1);
    assert!(loaded.delivered_at.is_none());
    assert!(loaded.channel.is_none());
}

#[tokio::test]
async fn test_in_flight_dedup() {
    let store = test_store().await;
    assert!(store
        .create_prompt(&new_prompt("u1", "habit_missed", "h1"))
        .await
        .unwrap());

    // Same (user, type, subject) while the first is in flight: rejected.
    assert!(!store
        .create_prompt(&new_prompt("u1", "habit_missed", "h1"))
        .await
        .unwrap());

    // Different subject or user is fine.
    assert!(store
        .create_prompt(&new_prompt("u1", "habit_missed", "h2"))
        .await
        .unwrap());
    assert!(store
        .create_prompt(&new_prompt("u2", "habit_missed", "h1"))
        .await
        .unwrap());
}

#[tokio::test]
async fn test_dedup_releases_after_terminal_state() {
    let store = test_store().await;
    let p = new_prompt("u1", "daily_checkin", "");
    store.create_prompt(&p).await.unwrap();
    store.mark_queued(&p.id).await.unwrap();
    store.begin_delivery(&p.id).await.unwrap();
    store.mark_delivered(&p.id, ChannelKind::InApp).await.unwrap();

    // Delivered is not in flight; a fresh check-in prompt may be created.
    assert!(store
        .create_prompt(&new_prompt("u1", "daily_checkin", ""))
        .await
        .unwrap());
}

#[tokio::test]
async fn test_lifecycle_cas_transitions() {
    let store = test_store().await;
    let p = new_prompt("u1", "habit_missed", "h1");
    store.create_prompt(&p).await.unwrap();

    assert!(store.mark_queued(&p.id).await.unwrap());
    // Second queue attempt loses the CAS.
    assert!(!store.mark_queued(&p.id).await.unwrap());

    assert!(store.begin_delivery(&p.id).await.unwrap());
    // A second worker cannot claim the same prompt.
    assert!(!store.begin_delivery(&p.id).await.unwrap());

    // delivered_at is null until the delivered transition.
    let mid = store.get_prompt(&p.id).await.unwrap().unwrap();
    assert_eq!(mid.state, PromptState::Delivering);
    assert!(mid.delivered_at.is_none());

    assert!(store.mark_delivered(&p.id, ChannelKind::Push).await.unwrap());
    let done = store.get_prompt(&p.id).await.unwrap().unwrap();
    assert_eq!(done.state, PromptState::Delivered);
    assert_eq!(done.channel, Some(ChannelKind::Push));
    assert!(done.delivered_at.is_some());
}

#[tokio::test]
async fn test_requeue_backs_off_then_fails_terminally() {
    let store = test_store().await;
    let p = new_prompt("u1", "habit_missed", "h1");
    store.create_prompt(&p).await.unwrap();
    store.mark_queued(&p.id).await.unwrap();

    // Two failed attempts with max_retries = 3: both retry.
    for attempt in 1..3u32 {
        assert!(store.begin_delivery(&p.id).await.unwrap());
        let disposition = store
            .requeue_after_failure(&p.id, "sink unreachable", 3, 30)
            .await
            .unwrap();
        assert!(matches!(disposition, RetryDisposition::Retry { .. }));
        let cur = store.get_prompt(&p.id).await.unwrap().unwrap();
        assert_eq!(cur.state, PromptState::Queued);
        assert_eq!(cur.retry_count, attempt);
        assert!(cur.next_attempt_not_before.unwrap() > Utc::now());
    }

    // Third failure exhausts the budget. The backoff gates the reclaim
    // query, not the claim CAS, so the test can claim directly.
    assert!(store.begin_delivery(&p.id).await.unwrap());
    let disposition = store
        .requeue_after_failure(&p.id, "sink unreachable", 3, 30)
        .await
        .unwrap();
    assert_eq!(disposition, RetryDisposition::Failed);
    let cur = store.get_prompt(&p.id).await.unwrap().unwrap();
    assert_eq!(cur.state, PromptState::Failed);
    assert!(cur.delivered_at.is_none());
}

#[tokio::test]
async fn test_mark_responded_is_idempotent() {
    let store = test_store().await;
    let p = new_prompt("u1", "habit_missed", "h1");
    store.create_prompt(&p).await.unwrap();
    store.mark_queued(&p.id).await.unwrap();
    store.begin_delivery(&p.id).await.unwrap();
    store.mark_delivered(&p.id, ChannelKind::InApp).await.unwrap();

    assert!(store
        .mark_responded(&p.id, "complete_now", &ResponseAction::CompleteHabit)
        .await
        .unwrap());
    // Duplicate submission loses the CAS.
    assert!(!store
        .mark_responded(&p.id, "complete_now", &ResponseAction::CompleteHabit)
        .await
        .unwrap());

    let done = store.get_prompt(&p.id).await.unwrap().unwrap();
    assert_eq!(done.state, PromptState::Responded);
    assert_eq!(done.response_value.as_deref(), Some("complete_now"));
    assert_eq!(done.response_action, Some(ResponseAction::CompleteHabit));
    assert!(done.responded_at.is_some());
    assert!(done.responded_at.unwrap() >= done.delivered_at.unwrap());
}

#[tokio::test]
async fn test_park_and_unpark() {
    let store = test_store().await;
    let p = new_prompt("u1", "habit_missed", "h1");
    store.create_prompt(&p).await.unwrap();
    store.mark_queued(&p.id).await.unwrap();

    assert!(store.park(&p.id).await.unwrap());
    // Parked prompts are invisible to the reclaim query...
    assert!(store.due_for_dispatch(10).await.unwrap().is_empty());
    // ...and cannot be claimed for delivery.
    assert!(!store.begin_delivery(&p.id).await.unwrap());

    let unparked = store.unpark_for_user("u1").await.unwrap();
    assert_eq!(unparked.len(), 1);
    assert_eq!(unparked[0].id, p.id);

    // Idempotent: nothing left to unpark.
    assert!(store.unpark_for_user("u1").await.unwrap().is_empty());
    assert_eq!(store.due_for_dispatch(10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_due_for_dispatch_respects_backoff() {
    let store = test_store().await;
    let mut p = new_prompt("u1", "habit_missed", "h1");
    p.next_attempt_not_before = Some(Utc::now() + Duration::hours(1));
    store.create_prompt(&p).await.unwrap();
    store.mark_queued(&p.id).await.unwrap();

    assert!(store.due_for_dispatch(10).await.unwrap().is_empty());

    let mut due = new_prompt("u1", "habit_missed", "h2");
    due.next_attempt_not_before = Some(Utc::now() - Duration::minutes(1));
    store.create_prompt(&due).await.unwrap();
    store.mark_queued(&due.id).await.unwrap();

    let ready = store.due_for_dispatch(10).await.unwrap();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].id, due.id);
}

#[tokio::test]
async fn test_expiry_sweep() {
    let store = test_store().await;
    let mut old = new_prompt("u1", "habit_missed", "h1");
    old.expires_at = Utc::now() - Duration::hours(1);
    store.create_prompt(&old).await.unwrap();
    store.mark_queued(&old.id).await.unwrap();

    let fresh = new_prompt("u1", "habit_missed", "h2");
    store.create_prompt(&fresh).await.unwrap();

    assert_eq!(store.expire_overdue().await.unwrap(), 1);
    let expired = store.get_prompt(&old.id).await.unwrap().unwrap();
    assert_eq!(expired.state, PromptState::Expired);
    assert!(expired.delivered_at.is_none());
    let kept = store.get_prompt(&fresh.id).await.unwrap().unwrap();
    assert_eq!(kept.state, PromptState::Pending);
}

#[tokio::test]
async fn test_cancel_only_hits_undelivered() {
    let store = test_store().await;
    let p = new_prompt("u1", "habit_missed", "h1");
    store.create_prompt(&p).await.unwrap();
    assert!(store.cancel_prompt(&p.id).await.unwrap());
    assert_eq!(
        store.get_prompt(&p.id).await.unwrap().unwrap().state,
        PromptState::Expired
    );

    let q = new_prompt("u1", "habit_missed", "h2");
    store.create_prompt(&q).await.unwrap();
    store.mark_queued(&q.id).await.unwrap();
    store.begin_delivery(&q.id).await.unwrap();
    store.mark_delivered(&q.id, ChannelKind::Email).await.unwrap();
    assert!(!store.cancel_prompt(&q.id).await.unwrap());
}

#[tokio::test]
async fn test_frequency_stats() {
    let store = test_store().await;

    // Deliver two prompts, respond to one.
    for (subject, respond) in [("h1", true), ("h2", false)] {
        let p = new_prompt("u1", "habit_missed", subject);
        store.create_prompt(&p).await.unwrap();
        store.mark_queued(&p.id).await.unwrap();
        store.begin_delivery(&p.id).await.unwrap();
        store.mark_delivered(&p.id, ChannelKind::InApp).await.unwrap();
        if respond {
            store
                .mark_responded(&p.id, "complete_now", &ResponseAction::CompleteHabit)
                .await
                .unwrap();
        }
    }
    // One still in flight.
    let pending = new_prompt("u1", "progress_stalled", "");
    store.create_prompt(&pending).await.unwrap();

    assert_eq!(store.prompt_load_today("u1").await.unwrap(), 3);
    assert!(store.last_delivered_at("u1").await.unwrap().is_some());
    assert_eq!(store.response_counts("u1", 20).await.unwrap(), (2, 1));
    assert!(store
        .last_of_type_at("u1", "habit_missed")
        .await
        .unwrap()
        .is_some());
    assert!(store
        .last_of_type_at("u1", "daily_checkin")
        .await
        .unwrap()
        .is_none());

    // Other users are unaffected.
    assert_eq!(store.prompt_load_today("u2").await.unwrap(), 0);
}

#[tokio::test]
async fn test_unacknowledged_listing() {
    let store = test_store().await;
    let p = new_prompt("u1", "habit_missed", "h1");
    store.create_prompt(&p).await.unwrap();
    store.mark_queued(&p.id).await.unwrap();
    store.begin_delivery(&p.id).await.unwrap();
    store.mark_delivered(&p.id, ChannelKind::InApp).await.unwrap();

    let unacked = store.unacknowledged_for_user("u1").await.unwrap();
    assert_eq!(unacked.len(), 1);
    assert_eq!(unacked[0].id, p.id);

    store
        .mark_responded(&p.id, "dismiss", &ResponseAction::Dismiss)
        .await
        .unwrap();
    assert!(store.unacknowledged_for_user("u1").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_preferences_missing_and_seeded() {
    let store = test_store().await;
    assert!(store.preferences("u1").await.unwrap().is_none());

    sqlx::query(
        "INSERT INTO preferences \
         (user_id, daily_max, min_interval_minutes, quiet_enabled, quiet_start, quiet_end, \
          in_app, push, email, enabled_types) \
         VALUES ('u1', 3, 120, 1, '22:00', '08:00', 1, 0, 1, '[\"habit_missed\"]')",
    )
    .execute(store.pool())
    .await
    .unwrap();

    let prefs = store.preferences("u1").await.unwrap().unwrap();
    assert_eq!(prefs.daily_max, 3);
    assert_eq!(prefs.min_interval_minutes, 120);
    assert!(prefs.quiet.enabled);
    assert!(!prefs.channels.push);
    assert!(prefs.type_enabled("habit_missed"));
    assert!(!prefs.type_enabled("daily_checkin"));
}

#[tokio::test]
async fn test_snapshot_source() {
    let store = test_store().await;
    assert!(store.active_users().await.unwrap().is_empty());

    sqlx::query(
        "INSERT INTO user_activity \
         (user_id, last_conversation_at, active_start, active_end, last_progress_at) \
         VALUES ('u1', '2026-08-01 09:15:00', '08:00', '21:00', NULL)",
    )
    .execute(store.pool())
    .await
    .unwrap();
    sqlx::query(
        "INSERT INTO habit_status (user_id, habit_id, name, last_completed_at) \
         VALUES ('u1', 'h1', 'Morning walk', '2026-08-01 07:30:00')",
    )
    .execute(store.pool())
    .await
    .unwrap();

    assert_eq!(store.active_users().await.unwrap(), vec!["u1"]);
    let snap = store.snapshot("u1").await.unwrap();
    assert!(snap.last_conversation_at.is_some());
    assert!(snap.active_start.is_some());
    assert!(snap.last_progress_at.is_none());
    assert_eq!(snap.habits.len(), 1);
    assert_eq!(snap.habits[0].habit_id, "h1");

    // Unknown users get an empty snapshot, not an error.
    let empty = store.snapshot("ghost").await.unwrap();
    assert!(empty.habits.is_empty());
}

#[tokio::test]
async fn test_delivery_log_writes() {
    let store = test_store().await;
    let log = DeliveryLog::new(store.pool().clone());
    log.log(&DeliveryEvent {
        prompt_id: "p1".into(),
        user_id: "u1".into(),
        channel: Some(ChannelKind::InApp),
        kind: DeliveryEventKind::Delivered,
        detail: None,
    })
    .await
    .unwrap();

    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM delivery_log WHERE prompt_id = 'p1'")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(count, 1);
}
