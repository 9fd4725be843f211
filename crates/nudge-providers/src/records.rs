//! Health-records service client — executes reply side effects.

use async_trait::async_trait;
use nudge_core::{config::RecordsConfig, error::NudgeError, traits::RecordService};
use tracing::{debug, info};

/// HTTP client for the health-records service.
pub struct HttpRecordService {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpRecordService {
    /// Create from config values.
    pub fn from_config(config: &RecordsConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        }
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> Result<(), NudgeError> {
        let url = format!("{}{path}", self.base_url);
        debug!("records: POST {url}");

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| NudgeError::Delivery(format!("records request failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(NudgeError::Delivery(format!(
                "records returned {status}: {text}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl RecordService for HttpRecordService {
    fn name(&self) -> &str {
        "http"
    }

    async fn complete_habit(&self, user_id: &str, habit_id: &str) -> Result<(), NudgeError> {
        self.post(
            "/v1/habits/complete",
            serde_json::json!({"user_id": user_id, "habit_id": habit_id}),
        )
        .await
    }

    async fn log_checkin(&self, user_id: &str, note: &str) -> Result<(), NudgeError> {
        self.post(
            "/v1/checkins",
            serde_json::json!({"user_id": user_id, "note": note}),
        )
        .await
    }
}

/// Record service that only logs. Used when no records backend is
/// configured, so replies still complete without side effects.
#[derive(Default)]
pub struct NoopRecordService;

impl NoopRecordService {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl RecordService for NoopRecordService {
    fn name(&self) -> &str {
        "noop"
    }

    async fn complete_habit(&self, user_id: &str, habit_id: &str) -> Result<(), NudgeError> {
        info!("records (noop): would complete habit {habit_id} for {user_id}");
        Ok(())
    }

    async fn log_checkin(&self, user_id: &str, note: &str) -> Result<(), NudgeError> {
        info!("records (noop): would log check-in for {user_id}: {note}");
        Ok(())
    }
}
