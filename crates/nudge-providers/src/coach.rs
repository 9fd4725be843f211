//! Coach service client: content synthesis and heuristic timing detection
//! over the same HTTP API.
//!
//! Both clients fail closed — a non-2xx status or a malformed body is an
//! explicit error, never silently-degraded content.

use async_trait::async_trait;
use nudge_core::{
    config::SynthesisConfig,
    error::NudgeError,
    prompt::{Priority, PromptContent, QuickReply, SynthesizedPrompt},
    snapshot::UserSnapshot,
    timing::PromptTiming,
    traits::{ContentSynthesizer, TimingHeuristic},
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// HTTP content synthesizer backed by the external coach service.
pub struct HttpSynthesizer {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpSynthesizer {
    /// Create from config values.
    pub fn from_config(config: &SynthesisConfig) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(config.timeout_secs))
                .build()
                .unwrap_or_default(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        }
    }
}

#[derive(Serialize)]
struct SynthesizeRequest<'a> {
    timing_type: &'a str,
    priority: Priority,
    confidence: f32,
    metadata: &'a serde_json::Value,
    user_context: &'a UserSnapshot,
}

#[derive(Deserialize)]
struct SynthesizeResponse {
    title: String,
    message: String,
    #[serde(default)]
    quick_replies: Vec<QuickReplyDto>,
    #[serde(default)]
    ttl_seconds: Option<i64>,
}

#[derive(Deserialize)]
struct QuickReplyDto {
    text: String,
    value: String,
    #[serde(default)]
    next_step: Option<String>,
}

#[async_trait]
impl ContentSynthesizer for HttpSynthesizer {
    fn name(&self) -> &str {
        "http"
    }

    async fn synthesize(
        &self,
        timing: &PromptTiming,
        snapshot: &UserSnapshot,
    ) -> Result<SynthesizedPrompt, NudgeError> {
        let url = format!("{}/v1/synthesize", self.base_url);
        let body = SynthesizeRequest {
            timing_type: &timing.kind,
            priority: timing.priority,
            confidence: timing.confidence,
            metadata: &timing.metadata,
            user_context: snapshot,
        };

        debug!("coach: POST {url} kind={}", timing.kind);

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| NudgeError::Synthesis(format!("coach request failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(NudgeError::Synthesis(format!(
                "coach returned {status}: {text}"
            )));
        }

        let parsed: SynthesizeResponse = resp
            .json()
            .await
            .map_err(|e| NudgeError::Synthesis(format!("coach: failed to parse response: {e}")))?;

        if parsed.title.trim().is_empty() || parsed.message.trim().is_empty() {
            return Err(NudgeError::Synthesis(
                "coach returned empty title or message".to_string(),
            ));
        }

        Ok(SynthesizedPrompt {
            content: PromptContent {
                title: parsed.title,
                body: parsed.message,
                quick_replies: parsed
                    .quick_replies
                    .into_iter()
                    .map(|q| QuickReply {
                        text: q.text,
                        value: q.value,
                        next_step: q.next_step,
                    })
                    .collect(),
            },
            ttl_seconds: parsed.ttl_seconds,
        })
    }
}

/// HTTP heuristic timing detector backed by the coach service.
pub struct HttpHeuristic {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpHeuristic {
    /// Create from config values.
    pub fn from_config(config: &SynthesisConfig) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(config.timeout_secs))
                .build()
                .unwrap_or_default(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        }
    }
}

#[derive(Deserialize)]
struct DetectResponse {
    #[serde(default)]
    timings: Vec<TimingDto>,
}

#[derive(Deserialize)]
struct TimingDto {
    kind: String,
    priority: Priority,
    confidence: f32,
    #[serde(default)]
    metadata: serde_json::Value,
}

#[async_trait]
impl TimingHeuristic for HttpHeuristic {
    fn name(&self) -> &str {
        "http"
    }

    async fn detect(&self, snapshot: &UserSnapshot) -> Result<Vec<PromptTiming>, NudgeError> {
        let url = format!("{}/v1/detect", self.base_url);

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(snapshot)
            .send()
            .await
            .map_err(|e| NudgeError::Detection(format!("heuristic request failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(NudgeError::Detection(format!(
                "heuristic returned {status}: {text}"
            )));
        }

        let parsed: DetectResponse = resp.json().await.map_err(|e| {
            NudgeError::Detection(format!("heuristic: failed to parse response: {e}"))
        })?;

        Ok(parsed
            .timings
            .into_iter()
            .filter(|t| !t.kind.trim().is_empty())
            .map(|t| PromptTiming {
                kind: t.kind,
                user_id: snapshot.user_id.clone(),
                priority: t.priority,
                confidence: t.confidence.clamp(0.0, 1.0),
                metadata: t.metadata,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthesize_request_serialization() {
        let timing = PromptTiming {
            kind: "habit_missed".into(),
            user_id: "u1".into(),
            priority: Priority::High,
            confidence: 0.8,
            metadata: serde_json::json!({"habit_id": "h1"}),
        };
        let snapshot = UserSnapshot::empty("u1");
        let body = SynthesizeRequest {
            timing_type: &timing.kind,
            priority: timing.priority,
            confidence: timing.confidence,
            metadata: &timing.metadata,
            user_context: &snapshot,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["timing_type"], "habit_missed");
        assert_eq!(json["priority"], "high");
        assert_eq!(json["metadata"]["habit_id"], "h1");
        assert_eq!(json["user_context"]["user_id"], "u1");
    }

    #[test]
    fn test_synthesize_response_parsing() {
        let json = r#"{
            "title": "Walk time",
            "message": "Your streak misses you.",
            "quick_replies": [{"text": "Done", "value": "complete_now"}],
            "ttl_seconds": 7200
        }"#;
        let resp: SynthesizeResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.title, "Walk time");
        assert_eq!(resp.quick_replies.len(), 1);
        assert!(resp.quick_replies[0].next_step.is_none());
        assert_eq!(resp.ttl_seconds, Some(7200));
    }

    #[test]
    fn test_detect_response_parsing_defaults() {
        let resp: DetectResponse = serde_json::from_str(r#"{}"#).unwrap();
        assert!(resp.timings.is_empty());

        let resp: DetectResponse = serde_json::from_str(
            r#"{"timings": [{"kind": "evening_reflection", "priority": "low", "confidence": 1.7}]}"#,
        )
        .unwrap();
        assert_eq!(resp.timings.len(), 1);
        assert_eq!(resp.timings[0].kind, "evening_reflection");
    }
}
