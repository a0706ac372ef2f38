use crate::{
    context::{Context, ContextEntry},
    error::RelayError,
    message::{InboundEvent, MediaRef, OutgoingMessage, SendReceipt},
    model::{Instance, Integration, MessageStatus, ProviderKind},
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Generic AI responder, the fallback for every unmatched message.
#[async_trait]
pub trait AiResponder: Send + Sync {
    /// Human-readable responder name.
    fn name(&self) -> &str;

    /// Produce a reply for the context. An empty reply means "say nothing".
    async fn complete(&self, context: &Context) -> Result<String, RelayError>;
}

/// Maps a message plus recent history to one label of a fixed vocabulary.
#[async_trait]
pub trait IntentClassifier: Send + Sync {
    async fn classify(
        &self,
        message: &str,
        history: &[ContextEntry],
        vocabulary: &[String],
    ) -> Result<String, RelayError>;
}

/// Speech-to-text.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio: Vec<u8>, mime_type: &str) -> Result<String, RelayError>;
}

/// A WhatsApp-capable messaging provider.
///
/// Parsing is pure; sending and media fetches talk to the provider's API
/// using the credentials on the instance.
#[async_trait]
pub trait MessagingProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Normalize one raw webhook body into zero or more events.
    fn parse_webhook(&self, body: &Value) -> Vec<InboundEvent>;

    /// Send a message through the instance.
    async fn send(
        &self,
        instance: &Instance,
        message: &OutgoingMessage,
    ) -> Result<SendReceipt, RelayError>;

    /// Download (and decrypt, where the provider encrypts) a media payload.
    async fn fetch_media(&self, instance: &Instance, media: &MediaRef)
        -> Result<Vec<u8>, RelayError>;
}

/// Durable storage for downloaded media. Returns a publicly reachable URL.
#[async_trait]
pub trait MediaStorage: Send + Sync {
    async fn store(&self, bytes: &[u8], mime_type: &str) -> Result<String, RelayError>;
}

/// An inbound message forwarded to a CRM open line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrmInbound {
    pub line_id: i64,
    pub phone: String,
    pub contact_name: Option<String>,
    pub provider_message_id: String,
    pub text: String,
    pub media_url: Option<String>,
}

/// Identifiers the CRM assigned to a forwarded message.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CrmChatRef {
    pub chat_id: Option<String>,
    pub user_id: Option<String>,
    pub message_id: Option<String>,
}

/// A delivery/read receipt relayed to the CRM for an operator message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrmReceipt {
    pub line_id: i64,
    pub status: MessageStatus,
    /// Chat id on the CRM side.
    pub crm_chat_id: String,
    pub crm_message_ids: Vec<String>,
    /// Chat id on our side (the contact's phone).
    pub external_chat_id: String,
    pub provider_message_ids: Vec<String>,
}

/// The CRM's remote procedure surface, as used by the pipeline.
#[async_trait]
pub trait CrmApi: Send + Sync {
    /// Forward an inbound WhatsApp message to the mapped line.
    async fn forward_inbound(
        &self,
        integration: &Integration,
        message: &CrmInbound,
    ) -> Result<CrmChatRef, RelayError>;

    /// Relay a delivery or read receipt for an operator message.
    async fn send_receipt(
        &self,
        integration: &Integration,
        receipt: &CrmReceipt,
    ) -> Result<(), RelayError>;

    /// Register the open-channel connector and bind its event handlers.
    async fn register_connector(&self, integration: &Integration) -> Result<(), RelayError>;

    /// Activate or deactivate the connector on one line.
    async fn set_line_active(
        &self,
        integration: &Integration,
        line_id: i64,
        active: bool,
    ) -> Result<(), RelayError>;

    /// Unbind and re-bind every event subscription. Returns the number bound.
    async fn rebind_events(&self, integration: &Integration) -> Result<usize, RelayError>;
}
