mod api;
mod engine;
mod registry;

use clap::{Parser, Subcommand};
use engine::Engine;
use nudge_channels::{EmailSink, PushGatewaySink};
use nudge_core::{
    config,
    prompt::ChannelKind,
    traits::{ChannelSink, ContentSynthesizer, RecordService, TimingHeuristic, UserStateSource},
};
use nudge_providers::{
    CannedSynthesizer, HttpHeuristic, HttpRecordService, HttpSynthesizer, NoopRecordService,
};
use nudge_store::Store;
use registry::{ConnectionRegistry, InAppSink, LocalFanout};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Parser)]
#[command(
    name = "nudge",
    version,
    about = "Proactive coaching notification engine"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config file.
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the coaching engine.
    Start,
    /// Check configuration, storage, and channel setup.
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match cli.command {
        Commands::Start => {
            let cfg = config::load(&cli.config)?;

            let store = Store::new(&cfg.store).await?;
            let synthesizer = build_synthesizer(&cfg)?;
            let heuristic = build_heuristic(&cfg)?;

            let records: Arc<dyn RecordService> = if cfg.records.base_url.is_empty() {
                Arc::new(NoopRecordService::new())
            } else {
                Arc::new(HttpRecordService::from_config(&cfg.records))
            };

            let (registry, connected_rx) =
                ConnectionRegistry::new(Arc::new(LocalFanout::new()), cfg.registry.clone());

            // The in-app sink rides the registry; push and email are
            // opt-in per config.
            let mut sinks: HashMap<ChannelKind, Arc<dyn ChannelSink>> = HashMap::new();
            sinks.insert(
                ChannelKind::InApp,
                Arc::new(InAppSink::new(Arc::clone(&registry))),
            );
            if let Some(ref push) = cfg.channels.push {
                if push.enabled {
                    if push.endpoint.is_empty() {
                        anyhow::bail!(
                            "push channel is enabled but channels.push.endpoint is empty"
                        );
                    }
                    sinks.insert(
                        ChannelKind::Push,
                        Arc::new(PushGatewaySink::new(push.clone())),
                    );
                }
            }
            if let Some(ref email) = cfg.channels.email {
                if email.enabled {
                    if email.endpoint.is_empty() {
                        anyhow::bail!(
                            "email channel is enabled but channels.email.endpoint is empty"
                        );
                    }
                    sinks.insert(ChannelKind::Email, Arc::new(EmailSink::new(email.clone())));
                }
            }

            println!("nudge — starting coaching engine...");
            let engine = Arc::new(Engine::new(
                store.clone(),
                Arc::new(store),
                synthesizer,
                heuristic,
                records,
                sinks,
                registry,
                cfg,
            ));
            engine.run(connected_rx).await?;
        }
        Commands::Status => {
            let cfg = config::load(&cli.config)?;
            println!("nudge — Status Check\n");
            println!("Config: {}", cli.config);
            println!("Database: {}", cfg.store.db_path);
            println!("Synthesizer: {}", cfg.synthesis.provider);
            println!(
                "Detector: {} (every {}s)",
                if cfg.detector.enabled {
                    "enabled"
                } else {
                    "disabled"
                },
                cfg.detector.poll_interval_secs
            );
            println!();

            match Store::new(&cfg.store).await {
                Ok(store) => {
                    let users = store.active_users().await.unwrap_or_default();
                    println!("  storage: ok ({} active users)", users.len());
                }
                Err(e) => println!("  storage: error ({e})"),
            }

            println!(
                "  push: {}",
                match &cfg.channels.push {
                    Some(p) if p.enabled && !p.endpoint.is_empty() => "configured",
                    Some(p) if p.enabled => "enabled but missing endpoint",
                    Some(_) => "disabled",
                    None => "not configured",
                }
            );
            println!(
                "  email: {}",
                match &cfg.channels.email {
                    Some(e) if e.enabled && !e.endpoint.is_empty() => "configured",
                    Some(e) if e.enabled => "enabled but missing endpoint",
                    Some(_) => "disabled",
                    None => "not configured",
                }
            );
            println!(
                "  api: {}",
                if cfg.api.enabled {
                    format!("{}:{}", cfg.api.host, cfg.api.port)
                } else {
                    "disabled".to_string()
                }
            );
        }
    }

    Ok(())
}

/// Build the configured content synthesizer.
fn build_synthesizer(cfg: &config::Config) -> anyhow::Result<Arc<dyn ContentSynthesizer>> {
    match cfg.synthesis.provider.as_str() {
        "canned" => Ok(Arc::new(CannedSynthesizer::new())),
        "http" => {
            if cfg.synthesis.base_url.is_empty() {
                anyhow::bail!(
                    "synthesis.provider is 'http' but synthesis.base_url is empty. \
                     Set it in config.toml."
                );
            }
            Ok(Arc::new(HttpSynthesizer::from_config(&cfg.synthesis)))
        }
        other => anyhow::bail!("unsupported synthesizer: {other}"),
    }
}

/// Build the optional heuristic timing detector.
fn build_heuristic(cfg: &config::Config) -> anyhow::Result<Option<Arc<dyn TimingHeuristic>>> {
    match cfg.detector.heuristic.as_str() {
        "none" => Ok(None),
        "http" => {
            if cfg.synthesis.base_url.is_empty() {
                anyhow::bail!(
                    "detector.heuristic is 'http' but synthesis.base_url is empty. \
                     The heuristic shares the coach service endpoint."
                );
            }
            Ok(Some(Arc::new(HttpHeuristic::from_config(&cfg.synthesis))))
        }
        other => anyhow::bail!("unsupported heuristic detector: {other}"),
    }
}
