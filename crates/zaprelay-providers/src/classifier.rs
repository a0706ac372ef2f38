//! Intent classification over a configurable label vocabulary.

use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;
use zaprelay_core::{
    config::AiConfig, context::ContextEntry, error::RelayError, traits::IntentClassifier,
};

use crate::openai::{chat_completion, ChatCompletionRequest, ChatMessage};

/// Label returned when the model answers outside the vocabulary.
pub const FALLBACK_INTENT: &str = "outro";

/// Classifier backed by an OpenAI-compatible chat model.
pub struct OpenAiClassifier {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiClassifier {
    pub fn new(config: &AiConfig) -> Self {
        let model = if config.classifier_model.is_empty() {
            config.model.clone()
        } else {
            config.classifier_model.clone()
        };
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(20))
                .build()
                .unwrap_or_default(),
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone(),
            model,
        }
    }
}

fn classification_prompt(vocabulary: &[String]) -> String {
    format!(
        "Classifique a intenção da última mensagem do cliente. \
         Responda apenas com UMA destas palavras, sem pontuação: {}.",
        vocabulary.join(", ")
    )
}

/// Map a raw model answer onto the vocabulary.
///
/// Exact label first, then a label contained in the answer, else the fallback.
pub fn normalize_label(answer: &str, vocabulary: &[String]) -> String {
    let cleaned: String = answer
        .trim()
        .trim_matches(|c: char| !c.is_alphanumeric())
        .to_lowercase();
    if let Some(label) = vocabulary.iter().find(|l| l.to_lowercase() == cleaned) {
        return label.to_lowercase();
    }
    if let Some(label) = vocabulary
        .iter()
        .find(|l| !l.is_empty() && cleaned.contains(&l.to_lowercase()))
    {
        return label.to_lowercase();
    }
    FALLBACK_INTENT.to_string()
}

#[async_trait]
impl IntentClassifier for OpenAiClassifier {
    async fn classify(
        &self,
        message: &str,
        history: &[ContextEntry],
        vocabulary: &[String],
    ) -> Result<String, RelayError> {
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatMessage::text("system", &classification_prompt(vocabulary)));
        for entry in history {
            messages.push(ChatMessage::text(&entry.role, &entry.content));
        }
        messages.push(ChatMessage::text("user", message));

        let body = ChatCompletionRequest {
            model: self.model.clone(),
            messages,
            temperature: Some(0.0),
            max_tokens: Some(10),
        };
        let answer = chat_completion(&self.client, &self.base_url, &self.api_key, &body).await?;
        let label = normalize_label(&answer, vocabulary);
        debug!("classifier: '{answer}' -> {label}");
        Ok(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vocab() -> Vec<String> {
        ["agendamento", "suporte", "vendas", "outro"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn test_normalize_label() {
        assert_eq!(normalize_label("Vendas.", &vocab()), "vendas");
        assert_eq!(normalize_label("  \"suporte\"\n", &vocab()), "suporte");
        assert_eq!(normalize_label("A intenção é agendamento", &vocab()), "agendamento");
        assert_eq!(normalize_label("reclamação", &vocab()), FALLBACK_INTENT);
        assert_eq!(normalize_label("", &vocab()), FALLBACK_INTENT);
    }

    #[test]
    fn test_prompt_lists_vocabulary() {
        let prompt = classification_prompt(&vocab());
        assert!(prompt.contains("agendamento, suporte, vendas, outro"));
    }
}
