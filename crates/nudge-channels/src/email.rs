//! Email delivery sink, backed by a transactional email HTTP API.

use async_trait::async_trait;
use nudge_core::{
    config::EmailConfig,
    error::NudgeError,
    prompt::{ChannelKind, PromptPayload},
    traits::ChannelSink,
};
use tracing::debug;

/// Email channel sink.
pub struct EmailSink {
    config: EmailConfig,
    client: reqwest::Client,
}

impl EmailSink {
    /// Create a new email sink from config.
    pub fn new(config: EmailConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ChannelSink for EmailSink {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Email
    }

    async fn send(&self, user_id: &str, payload: &PromptPayload) -> Result<(), NudgeError> {
        // Quick replies become plain links in the email body; the reply
        // endpoint resolves them back to this prompt.
        let mut body_text = payload.body.clone();
        if !payload.quick_replies.is_empty() {
            body_text.push_str("\n\n");
            for qr in &payload.quick_replies {
                body_text.push_str(&format!("- {} ({})\n", qr.text, qr.value));
            }
        }

        let body = serde_json::json!({
            "from": self.config.from_address,
            "to_user": user_id,
            "subject": payload.title,
            "text": body_text,
            "headers": { "X-Nudge-Prompt-Id": payload.prompt_id },
        });

        debug!("email: POST {} for user {user_id}", self.config.endpoint);

        let resp = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| NudgeError::Delivery(format!("email send failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let error_text = resp.text().await.unwrap_or_default();
            return Err(NudgeError::Delivery(format!(
                "email send failed ({status}): {error_text}"
            )));
        }

        Ok(())
    }
}
