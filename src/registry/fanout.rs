//! Cross-process fan-out seam.
//!
//! "Deliver event E to user U" goes through `Fanout::publish`; every
//! process subscribed to U's logical channel forwards the event to its own
//! local connections. The shipped `LocalFanout` is the in-process
//! transport; a broker-backed implementation slots in behind the same
//! trait for multi-process deployments.

use async_trait::async_trait;
use nudge_core::error::NudgeError;
use std::collections::HashMap;
use tokio::sync::{broadcast, RwLock};

/// A named event on a user's live stream.
#[derive(Debug, Clone)]
pub struct StreamEvent {
    /// Event name: `coaching_prompt`, `response_result`, `heartbeat`, `error`.
    pub event: String,
    /// JSON-encoded event payload.
    pub data: String,
}

impl StreamEvent {
    pub fn new(event: &str, data: String) -> Self {
        Self {
            event: event.to_string(),
            data,
        }
    }
}

/// Publish/subscribe transport for per-user event channels.
#[async_trait]
pub trait Fanout: Send + Sync {
    /// Publish an event to everyone subscribed to this user's channel.
    /// Errors when the user has no live subscribers anywhere.
    async fn publish(&self, user_id: &str, event: StreamEvent) -> Result<(), NudgeError>;

    /// Subscribe to a user's channel.
    async fn subscribe(&self, user_id: &str) -> broadcast::Receiver<StreamEvent>;

    /// Drop the user's channel once the last subscriber is gone.
    async fn release(&self, user_id: &str);
}

const FANOUT_CHANNEL_SIZE: usize = 64;

/// In-process fan-out: one broadcast channel per user.
#[derive(Default)]
pub struct LocalFanout {
    channels: RwLock<HashMap<String, broadcast::Sender<StreamEvent>>>,
}

impl LocalFanout {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Fanout for LocalFanout {
    async fn publish(&self, user_id: &str, event: StreamEvent) -> Result<(), NudgeError> {
        let channels = self.channels.read().await;
        match channels.get(user_id) {
            Some(tx) => tx.send(event).map(|_| ()).map_err(|_| {
                NudgeError::Registry(format!("no live subscribers for user {user_id}"))
            }),
            None => Err(NudgeError::Registry(format!(
                "no channel registered for user {user_id}"
            ))),
        }
    }

    async fn subscribe(&self, user_id: &str) -> broadcast::Receiver<StreamEvent> {
        let mut channels = self.channels.write().await;
        channels
            .entry(user_id.to_string())
            .or_insert_with(|| broadcast::channel(FANOUT_CHANNEL_SIZE).0)
            .subscribe()
    }

    async fn release(&self, user_id: &str) {
        let mut channels = self.channels.write().await;
        if let Some(tx) = channels.get(user_id) {
            if tx.receiver_count() == 0 {
                channels.remove(user_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_without_subscribers_errors() {
        let fanout = LocalFanout::new();
        let err = fanout
            .publish("u1", StreamEvent::new("heartbeat", "{}".into()))
            .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_subscribe_then_publish_delivers() {
        let fanout = LocalFanout::new();
        let mut rx = fanout.subscribe("u1").await;
        fanout
            .publish("u1", StreamEvent::new("coaching_prompt", "{\"x\":1}".into()))
            .await
            .unwrap();
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.event, "coaching_prompt");
    }

    #[tokio::test]
    async fn test_release_removes_channel_without_subscribers() {
        let fanout = LocalFanout::new();
        let rx = fanout.subscribe("u1").await;
        drop(rx);
        fanout.release("u1").await;
        assert!(fanout
            .publish("u1", StreamEvent::new("heartbeat", "{}".into()))
            .await
            .is_err());
    }
}
