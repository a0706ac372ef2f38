//! Canonical messages exchanged between the provider adapters and the pipeline.

use serde::{Deserialize, Serialize};

use crate::model::{MessageKind, MessageStatus};

/// Provider-specific pointer to a media payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaRef {
    /// Download URL (encrypted blob for the gateway, plain file for the aggregator).
    pub url: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    /// Base64 per-message media key. Present only for encrypted media.
    #[serde(default)]
    pub media_key: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
}

/// A message normalized from any provider webhook.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InboundMessage {
    /// Provider message id, used for deduplication.
    pub provider_message_id: String,
    /// Digits-only phone of the remote party.
    pub phone: String,
    pub push_name: Option<String>,
    pub profile_pic_url: Option<String>,
    pub kind: MessageKind,
    /// Text body or media caption.
    pub text: String,
    pub media: Option<MediaRef>,
    /// Sent from the connected phone itself rather than by the contact.
    pub from_me: bool,
    pub is_group: bool,
}

/// A delivery receipt from a provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusUpdate {
    pub provider_message_id: String,
    pub status: MessageStatus,
}

/// Connection lifecycle notification from a provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum LifecycleEvent {
    Qr { code: String },
    Connected { phone_number: Option<String> },
    Disconnected,
}

/// Everything a provider webhook can carry, after normalization.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum InboundEvent {
    Message(InboundMessage),
    Status(StatusUpdate),
    Lifecycle(LifecycleEvent),
    /// Recognized but irrelevant, or unrecognized; logged and acknowledged.
    Ignored(String),
}

/// An outbound send request handed to a messaging provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutgoingMessage {
    /// Digits-only destination phone.
    pub phone: String,
    pub kind: MessageKind,
    pub text: String,
    #[serde(default)]
    pub media_url: Option<String>,
}

impl OutgoingMessage {
    pub fn text(phone: &str, text: &str) -> Self {
        Self {
            phone: phone.to_string(),
            kind: MessageKind::Text,
            text: text.to_string(),
            media_url: None,
        }
    }
}

/// Receipt returned by a provider after a successful send.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SendReceipt {
    pub provider_message_id: Option<String>,
}
