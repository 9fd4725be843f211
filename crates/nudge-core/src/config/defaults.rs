//! Default value functions used by serde for config deserialization.

pub fn default_name() -> String {
    "nudge".to_string()
}

pub fn default_data_dir() -> String {
    "~/.nudge".to_string()
}

pub fn default_log_level() -> String {
    "info".to_string()
}

pub fn default_db_path() -> String {
    "~/.nudge/data/nudge.db".to_string()
}

pub fn default_true() -> bool {
    true
}

pub fn default_poll_interval_secs() -> u64 {
    300
}

pub fn default_max_candidates() -> usize {
    3
}

pub fn default_heuristic() -> String {
    "none".to_string()
}

pub fn default_daily_max() -> u32 {
    5
}

pub fn default_min_interval_minutes() -> u32 {
    90
}

pub fn default_engagement_window() -> u32 {
    20
}

pub fn default_engagement_threshold() -> f32 {
    0.3
}

pub fn default_engagement_min_sample() -> u32 {
    5
}

pub fn default_workers() -> usize {
    4
}

pub fn default_queue_capacity() -> usize {
    1024
}

pub fn default_send_timeout_secs() -> u64 {
    5
}

pub fn default_max_retries() -> u32 {
    5
}

pub fn default_retry_base_secs() -> u64 {
    30
}

pub fn default_reclaim_interval_secs() -> u64 {
    15
}

pub fn default_sweep_interval_secs() -> u64 {
    300
}

pub fn default_prompt_ttl_hours() -> i64 {
    24
}

pub fn default_heartbeat_interval_secs() -> u64 {
    30
}

pub fn default_stale_after_secs() -> i64 {
    90
}

pub fn default_synthesizer() -> String {
    "canned".to_string()
}

pub fn default_synthesis_timeout_secs() -> u64 {
    10
}

pub fn default_snooze_minutes() -> i64 {
    180
}

pub fn default_api_host() -> String {
    "127.0.0.1".to_string()
}

pub fn default_api_port() -> u16 {
    8090
}
