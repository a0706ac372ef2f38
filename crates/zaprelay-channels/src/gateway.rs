//! Self-hosted WhatsApp gateway (Evolution-style HTTP API).
//!
//! Webhooks arrive as `{"event": "...", "instance": "...", "data": ...}`.
//! Media URLs point at WhatsApp's CDN, so payloads must be decrypted with the
//! per-message `mediaKey` before use.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};
use zaprelay_core::{
    error::RelayError,
    message::{
        InboundEvent, InboundMessage, LifecycleEvent, MediaRef, OutgoingMessage, SendReceipt,
        StatusUpdate,
    },
    model::{Instance, MessageKind, MessageStatus, ProviderKind},
    phone,
    traits::MessagingProvider,
};

use crate::media::{decrypt_media, MediaClass};

/// Provider for the self-hosted gateway.
pub struct GatewayProvider {
    client: reqwest::Client,
}

impl GatewayProvider {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
        }
    }
}

impl Default for GatewayProvider {
    fn default() -> Self {
        Self::new()
    }
}

/// One value or an array of them, as a list.
fn items(data: &Value) -> Vec<&Value> {
    match data.as_array() {
        Some(arr) => arr.iter().collect(),
        None if data.is_null() => Vec::new(),
        None => vec![data],
    }
}

fn str_at<'a>(v: &'a Value, key: &str) -> Option<&'a str> {
    v.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

/// Media-bearing message sections and the kind they map to.
const MEDIA_SECTIONS: &[(&str, MessageKind)] = &[
    ("imageMessage", MessageKind::Image),
    ("audioMessage", MessageKind::Audio),
    ("videoMessage", MessageKind::Video),
    ("documentMessage", MessageKind::Document),
    ("documentWithCaptionMessage", MessageKind::Document),
    ("stickerMessage", MessageKind::Sticker),
];

/// Normalize one `messages.upsert` item.
fn parse_message(item: &Value) -> InboundEvent {
    let key = &item["key"];
    let Some(remote_jid) = str_at(key, "remoteJid") else {
        return InboundEvent::Ignored("message without remoteJid".into());
    };
    if remote_jid == "status@broadcast" {
        return InboundEvent::Ignored("status broadcast".into());
    }
    let Some(id) = str_at(key, "id") else {
        return InboundEvent::Ignored("message without id".into());
    };

    let body = &item["message"];
    if body.get("protocolMessage").is_some() || body.get("reactionMessage").is_some() {
        return InboundEvent::Ignored("protocol or reaction message".into());
    }

    let mut kind = MessageKind::Text;
    let mut media = None;
    let mut text = str_at(body, "conversation")
        .or_else(|| str_at(&body["extendedTextMessage"], "text"))
        .unwrap_or("")
        .to_string();

    for (section, section_kind) in MEDIA_SECTIONS {
        let Some(m) = body.get(*section) else {
            continue;
        };
        // documentWithCaptionMessage nests the real document one level down.
        let m = m.pointer("/message/documentMessage").unwrap_or(m);
        kind = *section_kind;
        if text.is_empty() {
            text = str_at(m, "caption").unwrap_or("").to_string();
        }
        if let Some(url) = str_at(m, "url") {
            media = Some(MediaRef {
                url: url.to_string(),
                mime_type: str_at(m, "mimetype").map(String::from),
                media_key: str_at(m, "mediaKey").map(String::from),
                file_name: str_at(m, "fileName").map(String::from),
            });
        }
        break;
    }

    if text.is_empty() && media.is_none() {
        let tag = item["messageType"].as_str().unwrap_or("unknown");
        return InboundEvent::Ignored(format!("unsupported message type '{tag}'"));
    }

    // Group chats are kept but flagged; the pipeline drops them.
    let is_group = phone::is_group_jid(remote_jid);
    InboundEvent::Message(InboundMessage {
        provider_message_id: id.to_string(),
        phone: phone::normalize(remote_jid),
        push_name: str_at(item, "pushName").map(String::from),
        profile_pic_url: str_at(item, "profilePicUrl").map(String::from),
        kind,
        text,
        media,
        from_me: key["fromMe"].as_bool().unwrap_or(false),
        is_group,
    })
}

/// Normalize one `messages.update` item.
fn parse_status(item: &Value) -> InboundEvent {
    let id = str_at(item, "keyId")
        .or_else(|| str_at(&item["key"], "id"))
        .or_else(|| str_at(item, "messageId"));
    let status = item["status"]
        .as_str()
        .or_else(|| item.pointer("/update/status").and_then(Value::as_str))
        .and_then(MessageStatus::parse);
    match (id, status) {
        (Some(id), Some(status)) => InboundEvent::Status(StatusUpdate {
            provider_message_id: id.to_string(),
            status,
        }),
        _ => InboundEvent::Ignored("status update without id or known status".into()),
    }
}

fn parse_connection(data: &Value) -> InboundEvent {
    match data["state"].as_str().unwrap_or("") {
        "open" | "connected" => InboundEvent::Lifecycle(LifecycleEvent::Connected {
            phone_number: str_at(data, "wuid")
                .or_else(|| str_at(data, "phone"))
                .map(phone::normalize)
                .filter(|p| !p.is_empty()),
        }),
        "close" | "closed" | "disconnected" => {
            InboundEvent::Lifecycle(LifecycleEvent::Disconnected)
        }
        other => InboundEvent::Ignored(format!("connection state '{other}'")),
    }
}

fn parse_qr(data: &Value) -> InboundEvent {
    let code = data
        .pointer("/qrcode/code")
        .and_then(Value::as_str)
        .or_else(|| data.pointer("/qrcode/base64").and_then(Value::as_str))
        .or_else(|| data["qrcode"].as_str())
        .or_else(|| data["qr"].as_str())
        .or_else(|| data["code"].as_str())
        .filter(|s| !s.is_empty());
    match code {
        Some(code) => InboundEvent::Lifecycle(LifecycleEvent::Qr {
            code: code.to_string(),
        }),
        None => InboundEvent::Ignored("qr event without code".into()),
    }
}

/// Parse a gateway webhook body. Pure.
pub fn parse_gateway_webhook(body: &Value) -> Vec<InboundEvent> {
    let event = body["event"].as_str().unwrap_or("");
    let data = &body["data"];
    match event.to_ascii_lowercase().replace('_', ".").as_str() {
        "messages.upsert" | "message" => items(data).into_iter().map(parse_message).collect(),
        "messages.update" | "status" => items(data).into_iter().map(parse_status).collect(),
        "connection.update" => vec![parse_connection(data)],
        "connected" => vec![InboundEvent::Lifecycle(LifecycleEvent::Connected {
            phone_number: str_at(data, "phone")
                .or_else(|| str_at(data, "wuid"))
                .map(phone::normalize),
        })],
        "disconnected" | "logout.instance" => {
            vec![InboundEvent::Lifecycle(LifecycleEvent::Disconnected)]
        }
        "qrcode.updated" | "qr" => vec![parse_qr(data)],
        "" => vec![InboundEvent::Ignored("webhook without event".into())],
        other => vec![InboundEvent::Ignored(format!("event '{other}'"))],
    }
}

/// Endpoint path and JSON body for an outgoing message.
fn send_request(message: &OutgoingMessage) -> Result<(&'static str, Value), RelayError> {
    let media = || {
        message.media_url.as_deref().ok_or_else(|| {
            RelayError::Channel(format!("{} message without media_url", message.kind.as_str()))
        })
    };
    Ok(match message.kind {
        MessageKind::Text => (
            "sendText",
            json!({"number": message.phone, "text": message.text}),
        ),
        MessageKind::Audio => (
            "sendWhatsAppAudio",
            json!({"number": message.phone, "audio": media()?}),
        ),
        MessageKind::Sticker => (
            "sendSticker",
            json!({"number": message.phone, "sticker": media()?}),
        ),
        MessageKind::Image | MessageKind::Video | MessageKind::Document => (
            "sendMedia",
            json!({
                "number": message.phone,
                "mediatype": message.kind.as_str(),
                "media": media()?,
                "caption": message.text,
            }),
        ),
    })
}

#[async_trait]
impl MessagingProvider for GatewayProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gateway
    }

    fn parse_webhook(&self, body: &Value) -> Vec<InboundEvent> {
        parse_gateway_webhook(body)
    }

    async fn send(
        &self,
        instance: &Instance,
        message: &OutgoingMessage,
    ) -> Result<SendReceipt, RelayError> {
        let cfg = &instance.config;
        if cfg.api_url.is_empty() || cfg.remote_instance.is_empty() {
            return Err(RelayError::Channel(format!(
                "instance {} has no gateway credentials",
                instance.id
            )));
        }
        let (endpoint, body) = send_request(message)?;
        let url = format!(
            "{}/message/{endpoint}/{}",
            cfg.api_url.trim_end_matches('/'),
            cfg.remote_instance
        );
        debug!("gateway: POST {url}");

        let resp = self
            .client
            .post(&url)
            .header("apikey", &cfg.api_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| RelayError::Channel(format!("gateway {endpoint} failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(RelayError::Channel(format!(
                "gateway {endpoint} returned {status}: {text}"
            )));
        }

        let parsed: Value = resp.json().await.unwrap_or(Value::Null);
        Ok(SendReceipt {
            provider_message_id: parsed
                .pointer("/key/id")
                .and_then(Value::as_str)
                .map(String::from),
        })
    }

    async fn fetch_media(
        &self,
        _instance: &Instance,
        media: &MediaRef,
    ) -> Result<Vec<u8>, RelayError> {
        let resp = self
            .client
            .get(&media.url)
            .send()
            .await
            .map_err(|e| RelayError::Channel(format!("media download failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(RelayError::Channel(format!(
                "media download returned {}",
                resp.status()
            )));
        }
        let blob = resp
            .bytes()
            .await
            .map_err(|e| RelayError::Channel(format!("media download failed: {e}")))?;

        match &media.media_key {
            Some(key) => {
                let class = MediaClass::from_mime(media.mime_type.as_deref().unwrap_or(""));
                decrypt_media(&blob, key, class)
            }
            None => {
                warn!("gateway: media without mediaKey, using payload as-is");
                Ok(blob.to_vec())
            }
        }
    }
}
