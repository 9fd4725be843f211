mod defaults;

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::NudgeError;
use crate::preferences::{ChannelOptIns, NotificationPreferences, QuietHours};
use defaults::*;

/// Top-level nudge configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub frequency: FrequencyConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub synthesis: SynthesisConfig,
    #[serde(default)]
    pub records: RecordsConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub responses: ResponsesConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

/// General engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            data_dir: default_data_dir(),
            log_level: default_log_level(),
        }
    }
}

/// Storage config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

/// Timing detector config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Candidates kept per user per cycle after merging.
    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,
    /// Heuristic detector backend: "none" or "http".
    #[serde(default = "default_heuristic")]
    pub heuristic: String,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_secs: default_poll_interval_secs(),
            max_candidates: default_max_candidates(),
            heuristic: default_heuristic(),
        }
    }
}

/// Frequency controller defaults, used when a user has no preference row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrequencyConfig {
    #[serde(default = "default_daily_max")]
    pub daily_max: u32,
    #[serde(default = "default_min_interval_minutes")]
    pub min_interval_minutes: u32,
    /// Trailing delivered-prompt window for the engagement throttle.
    #[serde(default = "default_engagement_window")]
    pub engagement_window: u32,
    /// Response rate below which only HIGH priority timings pass.
    #[serde(default = "default_engagement_threshold")]
    pub engagement_threshold: f32,
    /// Minimum delivered prompts before the throttle applies at all.
    #[serde(default = "default_engagement_min_sample")]
    pub engagement_min_sample: u32,
}

impl Default for FrequencyConfig {
    fn default() -> Self {
        Self {
            daily_max: default_daily_max(),
            min_interval_minutes: default_min_interval_minutes(),
            engagement_window: default_engagement_window(),
            engagement_threshold: default_engagement_threshold(),
            engagement_min_sample: default_engagement_min_sample(),
        }
    }
}

impl FrequencyConfig {
    /// Preferences assumed for a user with no stored preference row:
    /// all channels and timing kinds on, quiet hours off.
    pub fn default_preferences(&self) -> NotificationPreferences {
        NotificationPreferences {
            daily_max: self.daily_max,
            min_interval_minutes: self.min_interval_minutes,
            quiet: QuietHours {
                enabled: false,
                start: chrono::NaiveTime::from_hms_opt(22, 0, 0).expect("valid time"),
                end: chrono::NaiveTime::from_hms_opt(8, 0, 0).expect("valid time"),
            },
            channels: ChannelOptIns::default(),
            enabled_types: Vec::new(),
        }
    }
}

/// Delivery dispatcher config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Upper bound on a single sink send.
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Backoff base; attempt n waits base * 2^n.
    #[serde(default = "default_retry_base_secs")]
    pub retry_base_secs: u64,
    /// How often queued-but-due prompts are pulled back into the queue.
    #[serde(default = "default_reclaim_interval_secs")]
    pub reclaim_interval_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Default prompt TTL; the synthesizer may override per prompt.
    #[serde(default = "default_prompt_ttl_hours")]
    pub prompt_ttl_hours: i64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            send_timeout_secs: default_send_timeout_secs(),
            max_retries: default_max_retries(),
            retry_base_secs: default_retry_base_secs(),
            reclaim_interval_secs: default_reclaim_interval_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            prompt_ttl_hours: default_prompt_ttl_hours(),
        }
    }
}

/// Connection registry config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// A connection with no successful write for this long is pruned.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: i64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

/// Content synthesizer config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisConfig {
    /// "canned" (built-in templates) or "http" (external coach service).
    #[serde(default = "default_synthesizer")]
    pub provider: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_synthesis_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            provider: default_synthesizer(),
            base_url: String::new(),
            api_key: String::new(),
            timeout_secs: default_synthesis_timeout_secs(),
        }
    }
}

/// Health-records service config. Empty base_url disables side effects
/// (they are logged and dropped).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RecordsConfig {
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
}

/// Outbound channel config.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChannelsConfig {
    pub push: Option<PushConfig>,
    pub email: Option<EmailConfig>,
}

/// Push-notification gateway config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
}

/// Email delivery API config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub from_address: String,
}

/// Response handler config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponsesConfig {
    /// Delay before a snoozed prompt's follow-up is dispatched.
    #[serde(default = "default_snooze_minutes")]
    pub snooze_minutes: i64,
}

impl Default for ResponsesConfig {
    fn default() -> Self {
        Self {
            snooze_minutes: default_snooze_minutes(),
        }
    }
}

/// HTTP API config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_api_host")]
    pub host: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Bearer token required on all routes. Empty disables auth.
    #[serde(default)]
    pub api_key: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_api_host(),
            port: default_api_port(),
            api_key: String::new(),
        }
    }
}

/// Expand a leading `~/` to the user's home directory.
pub fn shellexpand(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return format!("{}/{rest}", home.to_string_lossy());
        }
    }
    path.to_string()
}

/// Load configuration from a TOML file, falling back to defaults when the
/// file does not exist.
pub fn load(path: &str) -> Result<Config, NudgeError> {
    let path = Path::new(path);
    if !path.exists() {
        tracing::info!(
            "Config file not found at {}, using defaults",
            path.display()
        );
        return Ok(Config::default());
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| NudgeError::Config(format!("failed to read {}: {}", path.display(), e)))?;

    let config: Config = toml::from_str(&content)
        .map_err(|e| NudgeError::Config(format!("failed to parse config: {e}")))?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.frequency.daily_max, 5);
        assert_eq!(cfg.dispatcher.max_retries, 5);
        assert_eq!(cfg.dispatcher.send_timeout_secs, 5);
        assert_eq!(cfg.dispatcher.prompt_ttl_hours, 24);
        assert_eq!(cfg.registry.stale_after_secs, 90);
        assert_eq!(cfg.detector.max_candidates, 3);
        assert_eq!(cfg.synthesis.provider, "canned");
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [dispatcher]
            workers = 8

            [frequency]
            daily_max = 3
            "#,
        )
        .unwrap();
        assert_eq!(cfg.dispatcher.workers, 8);
        assert_eq!(cfg.dispatcher.max_retries, 5);
        assert_eq!(cfg.frequency.daily_max, 3);
        assert_eq!(cfg.frequency.min_interval_minutes, 90);
    }

    #[test]
    fn test_default_preferences_from_frequency() {
        let prefs = FrequencyConfig::default().default_preferences();
        assert_eq!(prefs.daily_max, 5);
        assert!(!prefs.quiet.enabled);
        assert!(prefs.channels.in_app && prefs.channels.push && prefs.channels.email);
        assert!(prefs.type_enabled("anything"));
    }

    #[test]
    fn test_shellexpand_home() {
        std::env::set_var("HOME", "/home/tester");
        assert_eq!(shellexpand("~/x/y.db"), "/home/tester/x/y.db");
        assert_eq!(shellexpand("/abs/path"), "/abs/path");
    }
}
