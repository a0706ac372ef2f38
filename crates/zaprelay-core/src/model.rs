//! Persisted domain records.
//!
//! JSON columns (`config`, `metadata`, `bot_state`) are typed per use site.
//! Each typed record ignores unknown keys on read and carries them through
//! `extra` so a write-back never drops fields another writer added.

use crate::attendance::Attendance;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Fixed-width UTC timestamp format used for every stored timestamp.
///
/// Lexicographic order equals chronological order, so SQL can compare strings.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// Format a timestamp for storage.
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Parse a stored timestamp, accepting RFC 3339 and SQLite's `datetime('now')` form.
pub fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

// ---------------------------------------------------------------------------
// Integration
// ---------------------------------------------------------------------------

/// One external platform connection for a tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Integration {
    pub id: String,
    pub tenant_id: String,
    /// Platform discriminator (e.g. `"crm"`).
    pub platform: String,
    pub is_active: bool,
    pub config: IntegrationConfig,
    pub updated_at: DateTime<Utc>,
}

/// OAuth credential and feature flags kept on an integration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct IntegrationConfig {
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_expires_at: Option<DateTime<Utc>>,
    /// Base URL of the tenant's REST endpoint, e.g. `https://acme.example/rest/`.
    #[serde(default)]
    pub client_endpoint: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub member_id: String,
    #[serde(default)]
    pub connector_registered: bool,
    #[serde(default)]
    pub robot_registered: bool,
    #[serde(default)]
    pub activated_lines: Vec<i64>,
    /// Sticky flag set when the CRM rejected the token after a refresh attempt.
    #[serde(default)]
    pub token_failed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_error: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

// ---------------------------------------------------------------------------
// Instance
// ---------------------------------------------------------------------------

/// Which messaging provider backs an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Generic WhatsApp gateway (encrypted media, JID addressing).
    Gateway,
    /// Second aggregator (plain media URLs, phone addressing).
    Aggregator,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gateway => "gateway",
            Self::Aggregator => "aggregator",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "gateway" => Some(Self::Gateway),
            "aggregator" => Some(Self::Aggregator),
            _ => None,
        }
    }
}

/// Connection lifecycle of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    QrPending,
    Connected,
    Disconnected,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QrPending => "qr_pending",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "qr_pending" => Some(Self::QrPending),
            "connected" => Some(Self::Connected),
            "disconnected" => Some(Self::Disconnected),
            _ => None,
        }
    }
}

/// A messaging-provider connection (one phone number).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub provider: ProviderKind,
    pub status: InstanceStatus,
    pub phone_number: Option<String>,
    pub qr_code: Option<String>,
    pub config: InstanceConfig,
    pub created_at: DateTime<Utc>,
}

/// Provider credentials for an instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InstanceConfig {
    #[serde(default)]
    pub api_url: String,
    #[serde(default)]
    pub api_token: String,
    /// The provider's own name/id for this instance.
    #[serde(default)]
    pub remote_instance: String,
    /// Aggregators that sign requests with a second account-level token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_token: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

// ---------------------------------------------------------------------------
// Contact
// ---------------------------------------------------------------------------

/// A remote party, scoped to an instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: String,
    pub instance_id: String,
    /// Digits only.
    pub phone: String,
    pub name: Option<String>,
    pub profile_pic_url: Option<String>,
    pub metadata: ContactMetadata,
    pub created_at: DateTime<Utc>,
}

/// Identity tags used by the identity resolver.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ContactMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crm_user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crm_chat_id: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Candidate identifiers handed to the identity resolver.
#[derive(Debug, Clone, Default)]
pub struct IdentityCandidates {
    pub phone: Option<String>,
    pub remote_user_id: Option<String>,
    pub remote_chat_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

/// Conversation lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Open,
    InProgress,
    WaitingHuman,
    Completed,
    Transferred,
    Failed,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::WaitingHuman => "waiting_human",
            Self::Completed => "completed",
            Self::Transferred => "transferred",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "open" => Some(Self::Open),
            "in_progress" => Some(Self::InProgress),
            "waiting_human" => Some(Self::WaitingHuman),
            "completed" => Some(Self::Completed),
            "transferred" => Some(Self::Transferred),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Statuses that count as the single open conversation of a contact.
    pub const OPEN: [ConversationStatus; 3] = [Self::Open, Self::InProgress, Self::WaitingHuman];

    pub fn is_open(&self) -> bool {
        Self::OPEN.contains(self)
    }
}

/// Dialogue between one contact and one instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub tenant_id: String,
    pub instance_id: String,
    pub contact_id: String,
    pub status: ConversationStatus,
    pub attendance: Attendance,
    pub department: Option<String>,
    pub unread_count: i64,
    pub bot_state: BotState,
    pub last_activity_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Current layout version of [`BotState`].
pub const BOT_STATE_VERSION: u32 = 1;

fn bot_state_version() -> u32 {
    BOT_STATE_VERSION
}

/// Flow-progress record: the flow engine's only persistent memory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BotState {
    #[serde(default = "bot_state_version")]
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_flow_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detected_intent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent_detected_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_bot_message_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_flow_run_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for BotState {
    fn default() -> Self {
        Self {
            version: BOT_STATE_VERSION,
            active_flow_id: None,
            current_node_id: None,
            detected_intent: None,
            intent_detected_at: None,
            last_bot_message_at: None,
            last_flow_run_at: None,
            extra: Map::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Incoming,
    Outgoing,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Incoming => "incoming",
            Self::Outgoing => "outgoing",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "incoming" => Some(Self::Incoming),
            "outgoing" => Some(Self::Outgoing),
            _ => None,
        }
    }
}

/// Message content type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    Audio,
    Video,
    Document,
    Sticker,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Document => "document",
            Self::Sticker => "sticker",
        }
    }

    /// Unknown tags degrade to `Text` rather than failing.
    pub fn parse_lenient(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "image" => Self::Image,
            "audio" | "ptt" | "voice" => Self::Audio,
            "video" => Self::Video,
            "document" | "file" => Self::Document,
            "sticker" => Self::Sticker,
            _ => Self::Text,
        }
    }
}

/// Delivery status of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Received,
    Sent,
    Delivered,
    Read,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "received" => Some(Self::Received),
            "sent" | "server_ack" => Some(Self::Sent),
            "delivered" | "delivery_ack" => Some(Self::Delivered),
            "read" | "played" | "read_by_me" => Some(Self::Read),
            _ => None,
        }
    }
}

/// Where an outgoing message originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageOrigin {
    /// Flow engine or AI responder.
    Bot,
    /// Operator in the CRM.
    Crm,
    /// Direct API call.
    Api,
    /// Typed on the phone / provider app, seen as an echo.
    Device,
}

/// Cross-system identifiers remembered on a message.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MessageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<MessageOrigin>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crm_message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crm_chat_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One stored message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub conversation_id: String,
    pub instance_id: String,
    pub direction: Direction,
    pub kind: MessageKind,
    pub content: String,
    pub status: MessageStatus,
    pub media_url: Option<String>,
    pub transcription: Option<String>,
    pub is_bot: bool,
    pub provider_message_id: Option<String>,
    pub metadata: MessageMetadata,
    pub created_at: DateTime<Utc>,
}

/// Fields for inserting a message.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: String,
    pub instance_id: String,
    pub direction: Direction,
    pub kind: MessageKind,
    pub content: String,
    pub status: MessageStatus,
    pub media_url: Option<String>,
    pub transcription: Option<String>,
    pub is_bot: bool,
    pub provider_message_id: Option<String>,
    pub metadata: MessageMetadata,
}

// ---------------------------------------------------------------------------
// Channel mapping
// ---------------------------------------------------------------------------

/// Instance ↔ CRM line association inside a tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelMapping {
    pub id: String,
    pub tenant_id: String,
    pub instance_id: String,
    pub line_id: i64,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Event queue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Processing,
    Done,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A durable inbox entry for a CRM event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: String,
    pub tenant_id: String,
    pub event_type: String,
    pub payload: Value,
    pub status: QueueStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
}
