//! Push-notification gateway sink.
//!
//! Posts rendered prompts to a provider-agnostic gateway endpoint which
//! fans out to APNs/FCM. Provider internals stay behind the gateway.

use async_trait::async_trait;
use nudge_core::{
    config::PushConfig,
    error::NudgeError,
    prompt::{ChannelKind, PromptPayload},
    traits::ChannelSink,
};
use tracing::debug;

/// Push gateway channel sink.
pub struct PushGatewaySink {
    config: PushConfig,
    client: reqwest::Client,
}

impl PushGatewaySink {
    /// Create a new push sink from config.
    pub fn new(config: PushConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ChannelSink for PushGatewaySink {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Push
    }

    async fn send(&self, user_id: &str, payload: &PromptPayload) -> Result<(), NudgeError> {
        let body = serde_json::json!({
            "user_id": user_id,
            "title": payload.title,
            "body": payload.body,
            "data": {
                "prompt_id": payload.prompt_id,
                "quick_replies": payload.quick_replies,
            },
        });

        debug!("push: POST {} for user {user_id}", self.config.endpoint);

        let resp = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| NudgeError::Delivery(format!("push send failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let error_text = resp.text().await.unwrap_or_default();
            return Err(NudgeError::Delivery(format!(
                "push send failed ({status}): {error_text}"
            )));
        }

        Ok(())
    }
}
