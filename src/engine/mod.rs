//! Engine — wires the detector, dispatcher, registry, and response
//! handler together and owns the background task lifecycle.

mod admission;
mod assembly;
mod detector;
mod dispatcher;
pub mod queue;
mod responses;

pub use responses::{ReplyOutcome, ReplyRequest};

use crate::registry::ConnectionRegistry;
use nudge_core::{
    config::Config,
    error::NudgeError,
    prompt::ChannelKind,
    traits::{ChannelSink, ContentSynthesizer, RecordService, TimingHeuristic, UserStateSource},
};
use nudge_store::{DeliveryLog, Store};
use queue::DeliveryQueue;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::info;

/// The proactive coaching engine.
pub struct Engine {
    pub(crate) store: Store,
    pub(crate) source: Arc<dyn UserStateSource>,
    pub(crate) synthesizer: Arc<dyn ContentSynthesizer>,
    pub(crate) heuristic: Option<Arc<dyn TimingHeuristic>>,
    pub(crate) records: Arc<dyn RecordService>,
    pub(crate) sinks: HashMap<ChannelKind, Arc<dyn ChannelSink>>,
    pub(crate) registry: Arc<ConnectionRegistry>,
    pub(crate) queue: Arc<DeliveryQueue>,
    pub(crate) log: DeliveryLog,
    pub(crate) config: Config,
    pub(crate) uptime: Instant,
}

impl Engine {
    /// Create a new engine.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        source: Arc<dyn UserStateSource>,
        synthesizer: Arc<dyn ContentSynthesizer>,
        heuristic: Option<Arc<dyn TimingHeuristic>>,
        records: Arc<dyn RecordService>,
        sinks: HashMap<ChannelKind, Arc<dyn ChannelSink>>,
        registry: Arc<ConnectionRegistry>,
        config: Config,
    ) -> Self {
        let log = DeliveryLog::new(store.pool().clone());
        let queue = Arc::new(DeliveryQueue::new(config.dispatcher.queue_capacity));
        Self {
            store,
            source,
            synthesizer,
            heuristic,
            records,
            sinks,
            registry,
            queue,
            log,
            config,
            uptime: Instant::now(),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn uptime(&self) -> Instant {
        self.uptime
    }

    /// Externally cancel a prompt (e.g. its triggering habit was deleted).
    pub async fn cancel_prompt(&self, prompt_id: &str) -> Result<bool, NudgeError> {
        self.store.cancel_prompt(prompt_id).await
    }

    /// Run the engine until shutdown: spawn the detector, dispatcher
    /// workers, sweeps, registry heartbeat, and the HTTP API, then wait
    /// for ctrl-c.
    pub async fn run(
        self: Arc<Self>,
        connected_rx: mpsc::Receiver<String>,
    ) -> anyhow::Result<()> {
        info!(
            "nudge engine running | synthesizer: {} | records: {} | workers: {} | channels: {}",
            self.synthesizer.name(),
            self.records.name(),
            self.config.dispatcher.workers,
            self.sinks
                .keys()
                .map(|k| k.as_str())
                .collect::<Vec<_>>()
                .join(", "),
        );

        let mut handles = Vec::new();

        // Dispatcher workers.
        for worker_id in 0..self.config.dispatcher.workers.max(1) {
            handles.push(tokio::spawn(Self::worker_loop(
                worker_id,
                self.store.clone(),
                Arc::clone(&self.queue),
                self.sinks.clone(),
                Arc::clone(&self.registry),
                self.log.clone(),
                self.config.clone(),
            )));
        }

        // Reclaim loop: refills the queue after restarts and backoffs.
        handles.push(tokio::spawn(Self::reclaim_loop(
            self.store.clone(),
            Arc::clone(&self.queue),
            self.config.clone(),
        )));

        // Expiration sweep.
        handles.push(tokio::spawn(Self::sweep_loop(
            self.store.clone(),
            self.config.clone(),
        )));

        // Registry heartbeat and stale pruning.
        handles.push(tokio::spawn(Self::heartbeat_loop(
            Arc::clone(&self.registry),
            self.config.clone(),
        )));

        // Unpark prompts as users reconnect.
        handles.push(tokio::spawn(Self::unpark_loop(
            self.store.clone(),
            Arc::clone(&self.queue),
            connected_rx,
        )));

        // Timing detector.
        if self.config.detector.enabled {
            handles.push(tokio::spawn(Self::detector_loop(
                Arc::clone(&self.source),
                self.store.clone(),
                self.heuristic.clone(),
                Arc::clone(&self.synthesizer),
                Arc::clone(&self.queue),
                self.log.clone(),
                self.config.clone(),
            )));
        }

        // HTTP API (live event stream + reply endpoint).
        if self.config.api.enabled {
            let api_config = self.config.api.clone();
            let engine = Arc::clone(&self);
            handles.push(tokio::spawn(async move {
                crate::api::serve(api_config, engine).await;
            }));
        }

        tokio::signal::ctrl_c().await?;
        info!("Received shutdown signal");

        for handle in &handles {
            handle.abort();
        }

        info!("Shutdown complete.");
        Ok(())
    }
}
