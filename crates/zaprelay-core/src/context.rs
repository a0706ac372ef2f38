use serde::{Deserialize, Serialize};

use crate::model::{Direction, MessageRecord};

/// A single entry in the conversation history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextEntry {
    /// "user" or "assistant".
    pub role: String,
    /// The message content.
    pub content: String,
}

impl ContextEntry {
    /// Map a stored message onto a chat role: incoming is the contact, outgoing is us.
    pub fn from_record(record: &MessageRecord) -> Self {
        let role = match record.direction {
            Direction::Incoming => "user",
            Direction::Outgoing => "assistant",
        };
        let content = record
            .transcription
            .clone()
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| record.content.clone());
        Self {
            role: role.to_string(),
            content,
        }
    }
}

/// Conversation context passed to the AI responder and the intent classifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Context {
    /// System prompt prepended to every request.
    pub system_prompt: String,
    /// Conversation history (oldest first).
    pub history: Vec<ContextEntry>,
    /// The current inbound text (or transcript).
    pub current_message: String,
    /// Durable URL of an image attached to the current message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    /// Override the responder's default model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// A structured chat message for API-based providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiMessage {
    pub role: String,
    pub content: String,
}

impl Context {
    pub fn new(system_prompt: &str, message: &str) -> Self {
        Self {
            system_prompt: system_prompt.to_string(),
            history: Vec::new(),
            current_message: message.to_string(),
            image_url: None,
            model: None,
        }
    }

    /// Attach history, skipping blank entries.
    pub fn with_history(mut self, records: &[MessageRecord]) -> Self {
        self.history = records
            .iter()
            .map(ContextEntry::from_record)
            .filter(|e| !e.content.trim().is_empty())
            .collect();
        self
    }

    /// Convert context to structured API messages.
    ///
    /// Returns `(system_prompt, messages)`; the system prompt is kept apart so
    /// callers can place it however their API expects.
    pub fn to_api_messages(&self) -> (String, Vec<ApiMessage>) {
        let mut messages = Vec::with_capacity(self.history.len() + 1);

        for entry in &self.history {
            messages.push(ApiMessage {
                role: entry.role.clone(),
                content: entry.content.clone(),
            });
        }

        messages.push(ApiMessage {
            role: "user".to_string(),
            content: self.current_message.clone(),
        });

        (self.system_prompt.clone(), messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MessageKind, MessageMetadata, MessageStatus};
    use chrono::Utc;

    fn record(direction: Direction, content: &str, transcription: Option<&str>) -> MessageRecord {
        MessageRecord {
            id: "m".into(),
            conversation_id: "c".into(),
            instance_id: "i".into(),
            direction,
            kind: MessageKind::Text,
            content: content.into(),
            status: MessageStatus::Received,
            media_url: None,
            transcription: transcription.map(String::from),
            is_bot: false,
            provider_message_id: None,
            metadata: MessageMetadata::default(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_to_api_messages_appends_current() {
        let ctx = Context::new("sys", "oi").with_history(&[
            record(Direction::Incoming, "bom dia", None),
            record(Direction::Outgoing, "Olá! Como posso ajudar?", None),
        ]);
        let (system, msgs) = ctx.to_api_messages();
        assert_eq!(system, "sys");
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[0].role, "user");
        assert_eq!(msgs[1].role, "assistant");
        assert_eq!(msgs[2].content, "oi");
    }

    #[test]
    fn test_history_prefers_transcription_and_skips_blank() {
        let ctx = Context::new("", "x").with_history(&[
            record(Direction::Incoming, "[audio]", Some("quero marcar horário")),
            record(Direction::Incoming, "  ", None),
        ]);
        assert_eq!(ctx.history.len(), 1);
        assert_eq!(ctx.history[0].content, "quero marcar horário");
    }
}
