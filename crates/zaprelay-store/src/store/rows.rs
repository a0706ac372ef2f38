//! Row decoding shared by the store submodules.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use sqlx::{sqlite::SqliteRow, Row};
use tracing::warn;
use zaprelay_core::{
    attendance::Attendance,
    error::RelayError,
    flow::{Flow, TriggerType},
    model::{
        parse_ts, ChannelMapping, Contact, Conversation, ConversationStatus, Direction, Instance,
        InstanceStatus, Integration, MessageKind, MessageRecord, MessageStatus, ProviderKind,
        QueueEntry, QueueStatus,
    },
};

pub(super) const INTEGRATION_COLUMNS: &str = "id, tenant_id, platform, is_active, config, updated_at";
pub(super) const INSTANCE_COLUMNS: &str =
    "id, tenant_id, name, provider, status, phone_number, qr_code, config, created_at";
pub(super) const CONTACT_COLUMNS: &str =
    "id, instance_id, phone, name, profile_pic_url, metadata, created_at";
pub(super) const CONVERSATION_COLUMNS: &str = "id, tenant_id, instance_id, contact_id, status, \
     attendance_mode, assigned_to, department, unread_count, bot_state, last_activity_at, created_at";
pub(super) const MESSAGE_COLUMNS: &str = "id, conversation_id, instance_id, direction, kind, \
     content, status, media_url, transcription, is_bot, provider_message_id, metadata, created_at";
pub(super) const MAPPING_COLUMNS: &str = "id, tenant_id, instance_id, line_id, is_active, created_at";
pub(super) const QUEUE_COLUMNS: &str = "id, tenant_id, event_type, payload, status, attempts, \
     max_attempts, last_error, created_at, claimed_at, processed_at";
pub(super) const FLOW_COLUMNS: &str = "id, tenant_id, name, trigger_type, trigger_value, \
     intent_triggers, nodes, edges, is_active, created_at";

pub(super) fn get<T>(row: &SqliteRow, col: &str) -> Result<T, RelayError>
where
    T: for<'r> sqlx::Decode<'r, sqlx::Sqlite> + sqlx::Type<sqlx::Sqlite>,
{
    row.try_get(col)
        .map_err(|e| RelayError::Store(format!("column {col}: {e}")))
}

fn ts(row: &SqliteRow, col: &str) -> Result<DateTime<Utc>, RelayError> {
    let raw: String = get(row, col)?;
    parse_ts(&raw).ok_or_else(|| RelayError::Store(format!("column {col}: bad timestamp {raw}")))
}

fn opt_ts(row: &SqliteRow, col: &str) -> Result<Option<DateTime<Utc>>, RelayError> {
    let raw: Option<String> = get(row, col)?;
    Ok(raw.as_deref().and_then(parse_ts))
}

/// Decode a JSON column; malformed content decodes as the default value.
fn json<T: DeserializeOwned + Default>(row: &SqliteRow, col: &str) -> Result<T, RelayError> {
    let raw: String = get(row, col)?;
    match serde_json::from_str(&raw) {
        Ok(v) => Ok(v),
        Err(e) => {
            warn!("malformed json in column {col}, using default: {e}");
            Ok(T::default())
        }
    }
}

pub(super) fn to_json<T: serde::Serialize>(value: &T) -> Result<String, RelayError> {
    serde_json::to_string(value).map_err(|e| RelayError::Store(format!("serialize failed: {e}")))
}

pub(super) fn integration(row: &SqliteRow) -> Result<Integration, RelayError> {
    Ok(Integration {
        id: get(row, "id")?,
        tenant_id: get(row, "tenant_id")?,
        platform: get(row, "platform")?,
        is_active: get(row, "is_active")?,
        config: json(row, "config")?,
        updated_at: ts(row, "updated_at")?,
    })
}

pub(super) fn instance(row: &SqliteRow) -> Result<Instance, RelayError> {
    let provider: String = get(row, "provider")?;
    let status: String = get(row, "status")?;
    Ok(Instance {
        id: get(row, "id")?,
        tenant_id: get(row, "tenant_id")?,
        name: get(row, "name")?,
        provider: ProviderKind::parse(&provider)
            .ok_or_else(|| RelayError::Store(format!("unknown provider {provider}")))?,
        status: InstanceStatus::parse(&status).unwrap_or(InstanceStatus::Disconnected),
        phone_number: get(row, "phone_number")?,
        qr_code: get(row, "qr_code")?,
        config: json(row, "config")?,
        created_at: ts(row, "created_at")?,
    })
}

pub(super) fn contact(row: &SqliteRow) -> Result<Contact, RelayError> {
    Ok(Contact {
        id: get(row, "id")?,
        instance_id: get(row, "instance_id")?,
        phone: get(row, "phone")?,
        name: get(row, "name")?,
        profile_pic_url: get(row, "profile_pic_url")?,
        metadata: json(row, "metadata")?,
        created_at: ts(row, "created_at")?,
    })
}

pub(super) fn conversation(row: &SqliteRow) -> Result<Conversation, RelayError> {
    let status: String = get(row, "status")?;
    let mode: String = get(row, "attendance_mode")?;
    Ok(Conversation {
        id: get(row, "id")?,
        tenant_id: get(row, "tenant_id")?,
        instance_id: get(row, "instance_id")?,
        contact_id: get(row, "contact_id")?,
        status: ConversationStatus::parse(&status).unwrap_or(ConversationStatus::Open),
        attendance: Attendance::from_parts(&mode, get(row, "assigned_to")?),
        department: get(row, "department")?,
        unread_count: get(row, "unread_count")?,
        bot_state: json(row, "bot_state")?,
        last_activity_at: ts(row, "last_activity_at")?,
        created_at: ts(row, "created_at")?,
    })
}

pub(super) fn message(row: &SqliteRow) -> Result<MessageRecord, RelayError> {
    let direction: String = get(row, "direction")?;
    let kind: String = get(row, "kind")?;
    let status: String = get(row, "status")?;
    Ok(MessageRecord {
        id: get(row, "id")?,
        conversation_id: get(row, "conversation_id")?,
        instance_id: get(row, "instance_id")?,
        direction: Direction::parse(&direction)
            .ok_or_else(|| RelayError::Store(format!("unknown direction {direction}")))?,
        kind: MessageKind::parse_lenient(&kind),
        content: get(row, "content")?,
        status: MessageStatus::parse(&status).unwrap_or(MessageStatus::Sent),
        media_url: get(row, "media_url")?,
        transcription: get(row, "transcription")?,
        is_bot: get(row, "is_bot")?,
        provider_message_id: get(row, "provider_message_id")?,
        metadata: json(row, "metadata")?,
        created_at: ts(row, "created_at")?,
    })
}

pub(super) fn mapping(row: &SqliteRow) -> Result<ChannelMapping, RelayError> {
    Ok(ChannelMapping {
        id: get(row, "id")?,
        tenant_id: get(row, "tenant_id")?,
        instance_id: get(row, "instance_id")?,
        line_id: get(row, "line_id")?,
        is_active: get(row, "is_active")?,
        created_at: ts(row, "created_at")?,
    })
}

pub(super) fn queue_entry(row: &SqliteRow) -> Result<QueueEntry, RelayError> {
    let status: String = get(row, "status")?;
    let payload: String = get(row, "payload")?;
    let attempts: i64 = get(row, "attempts")?;
    let max_attempts: i64 = get(row, "max_attempts")?;
    Ok(QueueEntry {
        id: get(row, "id")?,
        tenant_id: get(row, "tenant_id")?,
        event_type: get(row, "event_type")?,
        payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
        status: QueueStatus::parse(&status)
            .ok_or_else(|| RelayError::Store(format!("unknown queue status {status}")))?,
        attempts: attempts.max(0) as u32,
        max_attempts: max_attempts.max(0) as u32,
        last_error: get(row, "last_error")?,
        created_at: ts(row, "created_at")?,
        claimed_at: opt_ts(row, "claimed_at")?,
        processed_at: opt_ts(row, "processed_at")?,
    })
}

pub(super) fn flow(row: &SqliteRow) -> Result<Flow, RelayError> {
    let trigger_type: String = get(row, "trigger_type")?;
    Ok(Flow {
        id: get(row, "id")?,
        tenant_id: get(row, "tenant_id")?,
        name: get(row, "name")?,
        trigger_type: TriggerType::parse(&trigger_type),
        trigger_value: get(row, "trigger_value")?,
        intent_triggers: json(row, "intent_triggers")?,
        nodes: json(row, "nodes")?,
        edges: json(row, "edges")?,
        is_active: get(row, "is_active")?,
        created_at: ts(row, "created_at")?,
    })
}
