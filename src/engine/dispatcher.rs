//! Delivery dispatcher: the worker pool, channel selection, retry with
//! backoff, offline parking, the reclaim loop, and the expiration sweep.

use super::queue::{effective_rank, DeliveryQueue};
use super::Engine;
use crate::registry::ConnectionRegistry;
use nudge_core::{
    config::Config,
    preferences::NotificationPreferences,
    prompt::{ChannelKind, Priority, PromptPayload, PromptState},
    traits::ChannelSink,
};
use nudge_store::{DeliveryEvent, DeliveryEventKind, DeliveryLog, RetryDisposition, Store};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Outcome of channel selection for one dispatch attempt.
#[derive(Debug, PartialEq, Eq)]
pub(super) enum Selection {
    Channel(ChannelKind),
    /// Every eligible channel needs a live connection and the user has
    /// none: wait for one instead of burning retries.
    ParkOffline,
    /// The user has opted out of (or we lack a sink for) every channel.
    NoChannel,
}

/// Deterministic per-priority channel preference order.
fn preference_order(priority: Priority) -> [ChannelKind; 3] {
    match priority {
        // Urgent prompts chase the user's attention: live connection
        // first, then push, then email.
        Priority::High | Priority::Medium => {
            [ChannelKind::InApp, ChannelKind::Push, ChannelKind::Email]
        }
        // Low-priority nudges go where they ask for nothing immediate.
        Priority::Low => [ChannelKind::Email, ChannelKind::Push, ChannelKind::InApp],
    }
}

/// Pick the first channel the user's preferences and current connectivity
/// allow.
pub(super) fn select_channel(
    priority: Priority,
    prefs: &NotificationPreferences,
    sinks: &HashMap<ChannelKind, Arc<dyn ChannelSink>>,
    online: bool,
) -> Selection {
    let mut blocked_offline = false;
    for kind in preference_order(priority) {
        if !prefs.channels.allows(kind) || !sinks.contains_key(&kind) {
            continue;
        }
        if kind.requires_connection() && !online {
            blocked_offline = true;
            continue;
        }
        return Selection::Channel(kind);
    }
    if blocked_offline {
        Selection::ParkOffline
    } else {
        Selection::NoChannel
    }
}

impl Engine {
    /// Background task: one dispatcher worker. Pulls prompt ids off the
    /// queue, claims them via the state CAS, and attempts delivery with a
    /// bounded timeout. All failures are isolated to the prompt at hand.
    pub(super) async fn worker_loop(
        worker_id: usize,
        store: Store,
        queue: Arc<DeliveryQueue>,
        sinks: HashMap<ChannelKind, Arc<dyn ChannelSink>>,
        registry: Arc<ConnectionRegistry>,
        log: DeliveryLog,
        config: Config,
    ) {
        loop {
            let prompt_id = queue.pop().await;
            if let Err(e) = Self::dispatch_one(
                &store, &sinks, &registry, &log, &config, &prompt_id,
            )
            .await
            {
                error!("worker {worker_id}: dispatch of {prompt_id} failed: {e}");
            }
        }
    }

    pub(super) async fn dispatch_one(
        store: &Store,
        sinks: &HashMap<ChannelKind, Arc<dyn ChannelSink>>,
        registry: &ConnectionRegistry,
        log: &DeliveryLog,
        config: &Config,
        prompt_id: &str,
    ) -> Result<(), nudge_core::error::NudgeError> {
        // Re-read immediately before the attempt: cancellation and expiry
        // land between enqueue and dispatch.
        let Some(prompt) = store.get_prompt(prompt_id).await? else {
            debug!("dispatch: prompt {prompt_id} vanished, skipping");
            return Ok(());
        };
        if prompt.state != PromptState::Queued || prompt.parked {
            debug!(
                "dispatch: skipping {prompt_id} (state {}, parked {})",
                prompt.state, prompt.parked
            );
            return Ok(());
        }

        let prefs = store
            .preferences(&prompt.user_id)
            .await?
            .unwrap_or_else(|| config.frequency.default_preferences());
        let online = registry.has_connection(&prompt.user_id).await;

        match select_channel(prompt.priority, &prefs, sinks, online) {
            Selection::Channel(kind) => {
                if !store.begin_delivery(&prompt.id).await? {
                    // Another worker claimed it, or it was cancelled.
                    return Ok(());
                }

                let sink = sinks.get(&kind).expect("selected sink exists");
                let payload = PromptPayload::from(&prompt);
                let send_timeout =
                    std::time::Duration::from_secs(config.dispatcher.send_timeout_secs);

                let outcome =
                    match tokio::time::timeout(send_timeout, sink.send(&prompt.user_id, &payload))
                        .await
                    {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(e)) => Err(e.to_string()),
                        Err(_) => Err(format!(
                            "send timed out after {}s",
                            config.dispatcher.send_timeout_secs
                        )),
                    };

                match outcome {
                    Ok(()) => {
                        if store.mark_delivered(&prompt.id, kind).await? {
                            info!(
                                "delivered prompt {} to user {} via {}",
                                prompt.id,
                                prompt.user_id,
                                kind.as_str()
                            );
                            log.log(&DeliveryEvent {
                                prompt_id: prompt.id.clone(),
                                user_id: prompt.user_id.clone(),
                                channel: Some(kind),
                                kind: DeliveryEventKind::Delivered,
                                detail: None,
                            })
                            .await?;
                        }
                    }
                    Err(detail) => {
                        Self::handle_failed_attempt(
                            store,
                            log,
                            config,
                            &prompt.id,
                            &prompt.user_id,
                            Some(kind),
                            detail,
                        )
                        .await?;
                    }
                }
            }
            Selection::ParkOffline => {
                if store.park(&prompt.id).await? {
                    debug!(
                        "parked prompt {} until user {} reconnects",
                        prompt.id, prompt.user_id
                    );
                    log.log(&DeliveryEvent {
                        prompt_id: prompt.id.clone(),
                        user_id: prompt.user_id.clone(),
                        channel: None,
                        kind: DeliveryEventKind::Parked,
                        detail: None,
                    })
                    .await?;
                }
            }
            Selection::NoChannel => {
                // Opted out of everything reachable: treat as a failed
                // attempt so the prompt eventually fails terminally
                // rather than cycling forever.
                if store.begin_delivery(&prompt.id).await? {
                    Self::handle_failed_attempt(
                        store,
                        log,
                        config,
                        &prompt.id,
                        &prompt.user_id,
                        None,
                        "no eligible delivery channel".to_string(),
                    )
                    .await?;
                }
            }
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_failed_attempt(
        store: &Store,
        log: &DeliveryLog,
        config: &Config,
        prompt_id: &str,
        user_id: &str,
        channel: Option<ChannelKind>,
        detail: String,
    ) -> Result<(), nudge_core::error::NudgeError> {
        let disposition = store
            .requeue_after_failure(
                prompt_id,
                &detail,
                config.dispatcher.max_retries,
                config.dispatcher.retry_base_secs,
            )
            .await?;

        match &disposition {
            RetryDisposition::Retry { next_attempt } => {
                warn!(
                    "delivery of {prompt_id} failed ({detail}); retrying after {next_attempt}"
                );
            }
            RetryDisposition::Failed => {
                error!(
                    "delivery of {prompt_id} failed terminally after {} attempts: {detail}",
                    config.dispatcher.max_retries
                );
            }
            RetryDisposition::Superseded => {
                debug!("prompt {prompt_id} left delivering concurrently, dropping attempt");
                return Ok(());
            }
        }

        log.log(&DeliveryEvent {
            prompt_id: prompt_id.to_string(),
            user_id: user_id.to_string(),
            channel,
            kind: DeliveryEventKind::DeliveryFailed,
            detail: Some(detail),
        })
        .await?;

        Ok(())
    }

    /// Background task: pull queued prompts whose backoff or schedule has
    /// elapsed back into the in-memory queue. Also the restart-recovery
    /// path — on boot the queue is empty and this loop refills it from
    /// the store.
    pub(super) async fn reclaim_loop(store: Store, queue: Arc<DeliveryQueue>, config: Config) {
        let interval = std::time::Duration::from_secs(config.dispatcher.reclaim_interval_secs);
        loop {
            match store.due_for_dispatch(256).await {
                Ok(candidates) => {
                    for candidate in candidates {
                        queue.push(
                            &candidate.id,
                            effective_rank(candidate.priority, candidate.retry_count),
                        );
                    }
                }
                Err(e) => error!("reclaim: failed to read due prompts: {e}"),
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Background task: expire pending/queued prompts past their TTL.
    pub(super) async fn sweep_loop(store: Store, config: Config) {
        let interval = std::time::Duration::from_secs(config.dispatcher.sweep_interval_secs);
        loop {
            tokio::time::sleep(interval).await;
            match store.expire_overdue().await {
                Ok(0) => {}
                Ok(n) => info!("expired {n} overdue prompts"),
                Err(e) => error!("expiry sweep failed: {e}"),
            }
        }
    }

    /// Background task: unpark prompts as users gain connections.
    pub(super) async fn unpark_loop(
        store: Store,
        queue: Arc<DeliveryQueue>,
        mut connected_rx: mpsc::Receiver<String>,
    ) {
        while let Some(user_id) = connected_rx.recv().await {
            match store.unpark_for_user(&user_id).await {
                Ok(candidates) => {
                    for candidate in candidates {
                        debug!("unparked prompt {} for user {user_id}", candidate.id);
                        queue.push(
                            &candidate.id,
                            effective_rank(candidate.priority, candidate.retry_count),
                        );
                    }
                }
                Err(e) => error!("unpark for {user_id} failed: {e}"),
            }
        }
    }

    /// Background task: registry heartbeat and stale-connection pruning.
    pub(super) async fn heartbeat_loop(registry: Arc<ConnectionRegistry>, config: Config) {
        let interval = std::time::Duration::from_secs(config.registry.heartbeat_interval_secs);
        loop {
            tokio::time::sleep(interval).await;
            registry.heartbeat_and_prune().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use nudge_core::error::NudgeError;
    use nudge_core::preferences::{ChannelOptIns, QuietHours};

    struct NullSink(ChannelKind);

    #[async_trait]
    impl ChannelSink for NullSink {
        fn kind(&self) -> ChannelKind {
            self.0
        }
        async fn send(&self, _user_id: &str, _payload: &PromptPayload) -> Result<(), NudgeError> {
            Ok(())
        }
    }

    fn all_sinks() -> HashMap<ChannelKind, Arc<dyn ChannelSink>> {
        [ChannelKind::InApp, ChannelKind::Push, ChannelKind::Email]
            .into_iter()
            .map(|k| (k, Arc::new(NullSink(k)) as Arc<dyn ChannelSink>))
            .collect()
    }

    fn prefs(in_app: bool, push: bool, email: bool) -> NotificationPreferences {
        NotificationPreferences {
            daily_max: 5,
            min_interval_minutes: 90,
            quiet: QuietHours {
                enabled: false,
                start: chrono::NaiveTime::from_hms_opt(22, 0, 0).unwrap(),
                end: chrono::NaiveTime::from_hms_opt(8, 0, 0).unwrap(),
            },
            channels: ChannelOptIns { in_app, push, email },
            enabled_types: Vec::new(),
        }
    }

    #[test]
    fn test_high_priority_prefers_live_connection() {
        let sinks = all_sinks();
        assert_eq!(
            select_channel(Priority::High, &prefs(true, true, true), &sinks, true),
            Selection::Channel(ChannelKind::InApp)
        );
        // Offline: falls back to push.
        assert_eq!(
            select_channel(Priority::High, &prefs(true, true, true), &sinks, false),
            Selection::Channel(ChannelKind::Push)
        );
    }

    #[test]
    fn test_low_priority_prefers_email() {
        let sinks = all_sinks();
        assert_eq!(
            select_channel(Priority::Low, &prefs(true, true, true), &sinks, true),
            Selection::Channel(ChannelKind::Email)
        );
    }

    #[test]
    fn test_offline_in_app_only_user_parks() {
        let sinks = all_sinks();
        assert_eq!(
            select_channel(Priority::High, &prefs(true, false, false), &sinks, false),
            Selection::ParkOffline
        );
        // Online again: delivers.
        assert_eq!(
            select_channel(Priority::High, &prefs(true, false, false), &sinks, true),
            Selection::Channel(ChannelKind::InApp)
        );
    }

    #[test]
    fn test_fully_opted_out_user_has_no_channel() {
        let sinks = all_sinks();
        assert_eq!(
            select_channel(Priority::Medium, &prefs(false, false, false), &sinks, true),
            Selection::NoChannel
        );
    }

    #[test]
    fn test_missing_sink_is_skipped() {
        let mut sinks = all_sinks();
        sinks.remove(&ChannelKind::InApp);
        assert_eq!(
            select_channel(Priority::High, &prefs(true, true, true), &sinks, true),
            Selection::Channel(ChannelKind::Push)
        );
    }
}
