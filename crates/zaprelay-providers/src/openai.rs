//! OpenAI-compatible chat completions: the generic AI responder.
//!
//! Works with OpenAI's API and any compatible endpoint. Exports `pub(crate)`
//! request plumbing reused by the intent classifier.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use zaprelay_core::{
    config::AiConfig,
    context::{ApiMessage, Context},
    error::RelayError,
    traits::AiResponder,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// OpenAI-compatible responder.
pub struct OpenAiResponder {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiResponder {
    /// Create from config values.
    pub fn from_config(base_url: String, api_key: String, model: String) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
            base_url,
            api_key,
            model,
        }
    }

    pub fn new(config: &AiConfig) -> Self {
        Self::from_config(
            config.base_url.clone(),
            config.api_key.clone(),
            config.model.clone(),
        )
    }
}

/// Message content: plain text, or text plus image parts for vision models.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub(crate) enum ChatContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub(crate) enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub(crate) struct ImageUrl {
    pub url: String,
}

impl ChatContent {
    pub(crate) fn as_text(&self) -> String {
        match self {
            Self::Text(t) => t.clone(),
            Self::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub(crate) struct ChatMessage {
    pub role: String,
    pub content: ChatContent,
}

impl ChatMessage {
    pub(crate) fn text(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: ChatContent::Text(content.to_string()),
        }
    }
}

/// Build OpenAI-format messages (system as a message role). An image URL is
/// attached to the final user message.
pub(crate) fn build_openai_messages(
    system: &str,
    api_messages: &[ApiMessage],
    image_url: Option<&str>,
) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(api_messages.len() + 1);
    if !system.is_empty() {
        messages.push(ChatMessage::text("system", system));
    }
    for m in api_messages {
        messages.push(ChatMessage::text(&m.role, &m.content));
    }
    if let (Some(url), Some(last)) = (image_url, messages.last_mut()) {
        if last.role == "user" {
            let text = last.content.as_text();
            let mut parts = Vec::with_capacity(2);
            if !text.is_empty() {
                parts.push(ContentPart::Text { text });
            }
            parts.push(ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: url.to_string(),
                },
            });
            last.content = ChatContent::Parts(parts);
        }
    }
    messages
}

#[derive(Serialize)]
pub(crate) struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

#[derive(Deserialize)]
pub(crate) struct ChatCompletionResponse {
    pub choices: Option<Vec<ChatChoice>>,
    pub usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
pub(crate) struct ChatChoice {
    pub message: Option<ChatMessage>,
}

#[derive(Deserialize)]
pub(crate) struct ChatUsage {
    pub total_tokens: Option<u64>,
}

/// POST a chat completion and return the first choice's text.
pub(crate) async fn chat_completion(
    client: &reqwest::Client,
    base_url: &str,
    api_key: &str,
    body: &ChatCompletionRequest,
) -> Result<String, RelayError> {
    if api_key.is_empty() {
        return Err(RelayError::Provider("openai: no API key configured".into()));
    }
    let url = format!("{}/chat/completions", base_url.trim_end_matches('/'));
    debug!("openai: POST {url} model={}", body.model);
    let start = Instant::now();

    let resp = client
        .post(&url)
        .header("Authorization", format!("Bearer {api_key}"))
        .json(body)
        .send()
        .await
        .map_err(|e| RelayError::Provider(format!("openai request failed: {e}")))?;

    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        return Err(RelayError::Provider(format!(
            "openai returned {status}: {text}"
        )));
    }

    let parsed: ChatCompletionResponse = resp
        .json()
        .await
        .map_err(|e| RelayError::Provider(format!("openai: failed to parse response: {e}")))?;

    let tokens = parsed.usage.as_ref().and_then(|u| u.total_tokens);
    debug!(
        "openai: {} tokens in {} ms",
        tokens.unwrap_or(0),
        start.elapsed().as_millis()
    );

    Ok(parsed
        .choices
        .as_ref()
        .and_then(|c| c.first())
        .and_then(|c| c.message.as_ref())
        .map(|m| m.content.as_text())
        .unwrap_or_default())
}

#[async_trait]
impl AiResponder for OpenAiResponder {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(&self, context: &Context) -> Result<String, RelayError> {
        let (system, api_messages) = context.to_api_messages();
        let effective_model = context.model.as_deref().unwrap_or(&self.model);

        let body = ChatCompletionRequest {
            model: effective_model.to_string(),
            messages: build_openai_messages(&system, &api_messages, context.image_url.as_deref()),
            temperature: Some(0.7),
            max_tokens: Some(500),
        };

        let text = chat_completion(&self.client, &self.base_url, &self.api_key, &body).await?;
        if text.trim().is_empty() {
            warn!("openai: empty completion");
        }
        Ok(text.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_responder_name() {
        let p = OpenAiResponder::from_config(
            "https://api.openai.com/v1".into(),
            "sk-test".into(),
            "gpt-4o-mini".into(),
        );
        assert_eq!(p.name(), "openai");
    }

    #[test]
    fn test_build_openai_messages() {
        let api_msgs = vec![
            ApiMessage {
                role: "user".into(),
                content: "Oi".into(),
            },
            ApiMessage {
                role: "assistant".into(),
                content: "Olá!".into(),
            },
            ApiMessage {
                role: "user".into(),
                content: "Como?".into(),
            },
        ];
        let messages = build_openai_messages("Seja útil.", &api_msgs, None);
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages[3].content, ChatContent::Text("Como?".into()));
    }

    #[test]
    fn test_image_attached_to_last_user_message() {
        let api_msgs = vec![ApiMessage {
            role: "user".into(),
            content: "o que é isso?".into(),
        }];
        let messages =
            build_openai_messages("", &api_msgs, Some("https://relay.example/media/a.jpg"));
        assert_eq!(messages.len(), 1);
        let json = serde_json::to_value(&messages[0]).unwrap();
        assert_eq!(json["content"][0]["type"], "text");
        assert_eq!(json["content"][1]["type"], "image_url");
        assert_eq!(
            json["content"][1]["image_url"]["url"],
            "https://relay.example/media/a.jpg"
        );
    }

    #[test]
    fn test_openai_response_parsing() {
        let json = r#"{"choices":[{"message":{"role":"assistant","content":"Olá!"},"finish_reason":"stop"}],"model":"gpt-4o","usage":{"total_tokens":42}}"#;
        let resp: ChatCompletionResponse = serde_json::from_str(json).unwrap();
        let text = resp
            .choices
            .as_ref()
            .and_then(|c| c.first())
            .and_then(|c| c.message.as_ref())
            .map(|m| m.content.as_text());
        assert_eq!(text, Some("Olá!".into()));
        assert_eq!(resp.usage.as_ref().and_then(|u| u.total_tokens), Some(42));
    }

    #[tokio::test]
    async fn test_missing_key_is_provider_error() {
        let p = OpenAiResponder::from_config("http://127.0.0.1:9".into(), String::new(), "m".into());
        let err = p.complete(&Context::new("", "oi")).await.unwrap_err();
        assert!(matches!(err, RelayError::Provider(_)));
    }
}
