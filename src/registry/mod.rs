//! Connection registry — location-transparent "send to user".
//!
//! Each process owns an in-memory map from user to its local connection
//! handles; it is mutated only by this process. Cross-process delivery
//! goes through the fan-out layer: `send_to_user` publishes, and a pump
//! task per user forwards fan-out events to local connections.

pub mod fanout;

pub use fanout::{Fanout, LocalFanout, StreamEvent};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use nudge_core::{
    config::RegistryConfig,
    error::NudgeError,
    prompt::{ChannelKind, PromptPayload},
    traits::ChannelSink,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

const CONNECTION_CHANNEL_SIZE: usize = 64;

struct ConnectionEntry {
    created_at: DateTime<Utc>,
    /// Last successful write; heartbeats refresh it. A connection that
    /// stops accepting writes goes stale and is pruned.
    last_activity: DateTime<Utc>,
    sender: mpsc::Sender<StreamEvent>,
}

/// All registry state for one user. The pump lives and dies with the
/// user's connection set, under the same lock.
#[derive(Default)]
struct UserConnections {
    entries: HashMap<String, ConnectionEntry>,
    pump: Option<JoinHandle<()>>,
}

/// Per-process connection registry over a shared fan-out layer. Cheap to
/// clone; all state lives behind shared handles.
#[derive(Clone)]
pub struct ConnectionRegistry {
    connections: Arc<RwLock<HashMap<String, UserConnections>>>,
    fanout: Arc<dyn Fanout>,
    /// Notifies the dispatcher that a user gained a connection, so parked
    /// prompts can be re-evaluated.
    connected_tx: mpsc::Sender<String>,
    config: RegistryConfig,
}

impl ConnectionRegistry {
    /// Create a registry. The returned receiver yields user ids as they
    /// gain connections; the dispatcher consumes it to unpark prompts.
    pub fn new(
        fanout: Arc<dyn Fanout>,
        config: RegistryConfig,
    ) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (connected_tx, connected_rx) = mpsc::channel(256);
        (
            Arc::new(Self {
                connections: Arc::new(RwLock::new(HashMap::new())),
                fanout,
                connected_tx,
                config,
            }),
            connected_rx,
        )
    }

    /// Register a connection for a user. Returns the connection id and the
    /// event receiver backing the client's stream. The first connection
    /// for a user subscribes this process to the user's fan-out channel.
    pub async fn register(&self, user_id: &str) -> (String, mpsc::Receiver<StreamEvent>) {
        let connection_id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(CONNECTION_CHANNEL_SIZE);
        let now = Utc::now();

        {
            let mut connections = self.connections.write().await;
            let user_conns = connections.entry(user_id.to_string()).or_default();
            user_conns.entries.insert(
                connection_id.clone(),
                ConnectionEntry {
                    created_at: now,
                    last_activity: now,
                    sender: tx,
                },
            );
            if user_conns.pump.is_none() {
                let fan_rx = self.fanout.subscribe(user_id).await;
                let registry = self.clone();
                let user = user_id.to_string();
                user_conns.pump = Some(tokio::spawn(async move {
                    registry.pump(user, fan_rx).await;
                }));
            }
        }

        let _ = self.connected_tx.send(user_id.to_string()).await;

        info!("connection {connection_id} registered for user {user_id}");
        (connection_id, rx)
    }

    /// Remove a connection. The last connection for a user tears down the
    /// fan-out subscription.
    pub async fn unregister(&self, user_id: &str, connection_id: &str) {
        let pump = {
            let mut connections = self.connections.write().await;
            let mut user_emptied = false;
            if let Some(user_conns) = connections.get_mut(user_id) {
                user_conns.entries.remove(connection_id);
                user_emptied = user_conns.entries.is_empty();
            }
            if user_emptied {
                connections.remove(user_id).and_then(|u| u.pump)
            } else {
                None
            }
        };

        if let Some(pump) = pump {
            self.stop_pump(user_id, pump).await;
        }

        info!("connection {connection_id} unregistered for user {user_id}");
    }

    /// Whether this process holds at least one live connection for the user.
    pub async fn has_connection(&self, user_id: &str) -> bool {
        let connections = self.connections.read().await;
        connections
            .get(user_id)
            .map(|c| !c.entries.is_empty())
            .unwrap_or(false)
    }

    /// Total live connections in this process (for health reporting).
    pub async fn active_connections(&self) -> usize {
        let connections = self.connections.read().await;
        connections.values().map(|c| c.entries.len()).sum()
    }

    /// Oldest live connection age in seconds, if any (for health reporting).
    pub async fn oldest_connection_secs(&self) -> Option<i64> {
        let connections = self.connections.read().await;
        connections
            .values()
            .flat_map(|c| c.entries.values())
            .map(|e| (Utc::now() - e.created_at).num_seconds())
            .max()
    }

    /// Location-transparent send: publish to the user's fan-out channel.
    /// Every subscribed process (this one included) forwards to its local
    /// connections. Errors when no process holds a connection for the user.
    pub async fn send_to_user(&self, user_id: &str, event: StreamEvent) -> Result<(), NudgeError> {
        self.fanout.publish(user_id, event).await
    }

    /// Forward fan-out events for one user to local connections until the
    /// channel closes.
    async fn pump(self, user_id: String, mut rx: broadcast::Receiver<StreamEvent>) {
        loop {
            match rx.recv().await {
                Ok(event) => self.deliver_local(&user_id, event).await,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("fanout pump lagged {n} events for user {user_id}");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!("fanout pump stopped for user {user_id}");
    }

    /// Write an event to every local connection for the user, dropping
    /// connections whose receiver has gone away.
    async fn deliver_local(&self, user_id: &str, event: StreamEvent) {
        let now = Utc::now();
        let mut connections = self.connections.write().await;
        let Some(user_conns) = connections.get_mut(user_id) else {
            return;
        };
        user_conns
            .entries
            .retain(|connection_id, entry| match entry.sender.try_send(event.clone()) {
                Ok(()) => {
                    entry.last_activity = now;
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    info!("dropping closed connection {connection_id} for user {user_id}");
                    false
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // Slow consumer: keep the connection and let the stale
                    // timer decide its fate.
                    warn!("connection {connection_id} for user {user_id} is not draining");
                    true
                }
            });
        // The pump is the caller here; emptied users are torn down by the
        // next heartbeat pass rather than by aborting ourselves.
    }

    /// Heartbeat every local connection and prune the stale ones. A
    /// connection with no successful write for `stale_after_secs` is dead
    /// even without a clean close — mandatory so the registry never
    /// believes an unreachable user is reachable.
    pub async fn heartbeat_and_prune(&self) {
        let now = Utc::now();
        let stale_cutoff = now - Duration::seconds(self.config.stale_after_secs);
        let heartbeat =
            StreamEvent::new("heartbeat", format!("{{\"ts\":\"{}\"}}", now.to_rfc3339()));

        let mut stopped_pumps = Vec::new();
        {
            let mut connections = self.connections.write().await;
            for (user_id, user_conns) in connections.iter_mut() {
                user_conns.entries.retain(|connection_id, entry| {
                    if entry.last_activity < stale_cutoff {
                        info!(
                            "pruning stale connection {connection_id} for user {user_id} \
                             (idle since {})",
                            entry.last_activity
                        );
                        return false;
                    }
                    match entry.sender.try_send(heartbeat.clone()) {
                        Ok(()) => {
                            entry.last_activity = now;
                            true
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            info!("pruning closed connection {connection_id} for user {user_id}");
                            false
                        }
                        Err(mpsc::error::TrySendError::Full(_)) => true,
                    }
                });
            }
            connections.retain(|user_id, user_conns| {
                if user_conns.entries.is_empty() {
                    if let Some(pump) = user_conns.pump.take() {
                        stopped_pumps.push((user_id.clone(), pump));
                    }
                    false
                } else {
                    true
                }
            });
        }

        for (user_id, pump) in stopped_pumps {
            self.stop_pump(&user_id, pump).await;
        }
    }

    /// Stop a user's fan-out pump and release the channel. The pump is
    /// awaited after abort so its broadcast receiver is actually dropped
    /// before the fan-out layer checks for remaining subscribers.
    async fn stop_pump(&self, user_id: &str, pump: JoinHandle<()>) {
        pump.abort();
        let _ = pump.await;
        self.fanout.release(user_id).await;
    }
}

/// In-app channel sink: delivery is a `coaching_prompt` event on the
/// user's live stream, routed through the registry's fan-out layer.
pub struct InAppSink {
    registry: Arc<ConnectionRegistry>,
}

impl InAppSink {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl ChannelSink for InAppSink {
    fn kind(&self) -> ChannelKind {
        ChannelKind::InApp
    }

    async fn send(&self, user_id: &str, payload: &PromptPayload) -> Result<(), NudgeError> {
        let data = serde_json::to_string(payload)?;
        self.registry
            .send_to_user(user_id, StreamEvent::new("coaching_prompt", data))
            .await
            .map_err(|e| NudgeError::Delivery(format!("in-app send failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_registry() -> (Arc<ConnectionRegistry>, mpsc::Receiver<String>) {
        ConnectionRegistry::new(Arc::new(LocalFanout::new()), RegistryConfig::default())
    }

    #[tokio::test]
    async fn test_register_send_receive() {
        let (registry, mut connected_rx) = test_registry();
        let (_conn_id, mut rx) = registry.register("u1").await;

        assert_eq!(connected_rx.recv().await.unwrap(), "u1");
        assert!(registry.has_connection("u1").await);

        registry
            .send_to_user("u1", StreamEvent::new("coaching_prompt", "{}".into()))
            .await
            .unwrap();
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.event, "coaching_prompt");
    }

    #[tokio::test]
    async fn test_send_without_connection_errors() {
        let (registry, _connected_rx) = test_registry();
        let err = registry
            .send_to_user("ghost", StreamEvent::new("coaching_prompt", "{}".into()))
            .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_unregister_last_connection_clears_user() {
        let (registry, _connected_rx) = test_registry();
        let (conn_id, rx) = registry.register("u1").await;
        drop(rx);
        registry.unregister("u1", &conn_id).await;

        assert!(!registry.has_connection("u1").await);
        assert_eq!(registry.active_connections().await, 0);
        assert!(registry
            .send_to_user("u1", StreamEvent::new("coaching_prompt", "{}".into()))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_reconnect_after_unregister_delivers_again() {
        let (registry, _connected_rx) = test_registry();
        let (conn_id, rx) = registry.register("u1").await;
        drop(rx);
        registry.unregister("u1", &conn_id).await;

        let (_conn_id, mut rx) = registry.register("u1").await;
        registry
            .send_to_user("u1", StreamEvent::new("coaching_prompt", "{}".into()))
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().event, "coaching_prompt");
    }

    #[tokio::test]
    async fn test_fanout_reaches_all_user_connections() {
        let (registry, _connected_rx) = test_registry();
        let (_c1, mut rx1) = registry.register("u1").await;
        let (_c2, mut rx2) = registry.register("u1").await;
        assert_eq!(registry.active_connections().await, 2);

        registry
            .send_to_user("u1", StreamEvent::new("response_result", "{}".into()))
            .await
            .unwrap();

        assert_eq!(rx1.recv().await.unwrap().event, "response_result");
        assert_eq!(rx2.recv().await.unwrap().event, "response_result");
    }

    #[tokio::test]
    async fn test_heartbeat_prunes_closed_connections() {
        let (registry, _connected_rx) = test_registry();
        let (_conn_id, rx) = registry.register("u1").await;
        drop(rx); // Socket died without a clean close.

        registry.heartbeat_and_prune().await;
        assert!(!registry.has_connection("u1").await);
        assert!(registry
            .send_to_user("u1", StreamEvent::new("coaching_prompt", "{}".into()))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_heartbeat_keeps_live_connections() {
        let (registry, _connected_rx) = test_registry();
        let (_conn_id, mut rx) = registry.register("u1").await;

        registry.heartbeat_and_prune().await;
        assert!(registry.has_connection("u1").await);
        assert_eq!(rx.recv().await.unwrap().event, "heartbeat");
    }

    #[tokio::test]
    async fn test_in_app_sink_requires_connection() {
        let (registry, _connected_rx) = test_registry();
        let sink = InAppSink::new(Arc::clone(&registry));
        let payload = PromptPayload {
            prompt_id: "p1".into(),
            title: "t".into(),
            body: "b".into(),
            quick_replies: vec![],
            priority: nudge_core::prompt::Priority::High,
        };

        assert!(sink.send("u1", &payload).await.is_err());

        let (_conn_id, mut rx) = registry.register("u1").await;
        sink.send("u1", &payload).await.unwrap();
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.event, "coaching_prompt");
        assert!(ev.data.contains("p1"));
    }
}
