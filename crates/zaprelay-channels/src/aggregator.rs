//! Hosted WhatsApp aggregator (Z-API style).
//!
//! Webhooks are flat objects discriminated by `type`. Media arrives as plain,
//! already-decrypted download URLs.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;
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

/// Provider for the hosted aggregator.
pub struct AggregatorProvider {
    client: reqwest::Client,
}

impl AggregatorProvider {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
        }
    }
}

impl Default for AggregatorProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn str_at<'a>(v: &'a Value, key: &str) -> Option<&'a str> {
    v.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

/// Aggregator status names. `RECEIVED` is the recipient's device ack.
fn parse_status_name(raw: &str) -> Option<MessageStatus> {
    match raw.to_ascii_uppercase().as_str() {
        "SENT" => Some(MessageStatus::Sent),
        "RECEIVED" | "DELIVERED" => Some(MessageStatus::Delivered),
        "READ" | "READ_BY_ME" | "PLAYED" => Some(MessageStatus::Read),
        _ => None,
    }
}

/// (section, url field, kind) for each media section of a received callback.
const MEDIA_SECTIONS: &[(&str, &str, MessageKind)] = &[
    ("image", "imageUrl", MessageKind::Image),
    ("audio", "audioUrl", MessageKind::Audio),
    ("video", "videoUrl", MessageKind::Video),
    ("document", "documentUrl", MessageKind::Document),
    ("sticker", "stickerUrl", MessageKind::Sticker),
];

fn parse_received(body: &Value) -> InboundEvent {
    let Some(id) = str_at(body, "messageId") else {
        return InboundEvent::Ignored("received callback without messageId".into());
    };
    let Some(raw_phone) = str_at(body, "phone") else {
        return InboundEvent::Ignored("received callback without phone".into());
    };
    if body["isStatusReply"].as_bool().unwrap_or(false) || body.get("reaction").is_some() {
        return InboundEvent::Ignored("status reply or reaction".into());
    }

    let mut kind = MessageKind::Text;
    let mut media = None;
    let mut text = body
        .pointer("/text/message")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();

    for (section, url_field, section_kind) in MEDIA_SECTIONS {
        let Some(m) = body.get(*section).filter(|v| v.is_object()) else {
            continue;
        };
        kind = *section_kind;
        if text.is_empty() {
            text = str_at(m, "caption").unwrap_or("").to_string();
        }
        if let Some(url) = str_at(m, url_field) {
            media = Some(MediaRef {
                url: url.to_string(),
                mime_type: str_at(m, "mimeType").map(String::from),
                media_key: None,
                file_name: str_at(m, "fileName").map(String::from),
            });
        }
        break;
    }

    if text.is_empty() && media.is_none() {
        return InboundEvent::Ignored("received callback without content".into());
    }

    InboundEvent::Message(InboundMessage {
        provider_message_id: id.to_string(),
        phone: phone::normalize(raw_phone),
        push_name: str_at(body, "senderName")
            .or_else(|| str_at(body, "chatName"))
            .map(String::from),
        profile_pic_url: str_at(body, "photo")
            .or_else(|| str_at(body, "senderPhoto"))
            .map(String::from),
        kind,
        text,
        media,
        from_me: body["fromMe"].as_bool().unwrap_or(false),
        is_group: body["isGroup"].as_bool().unwrap_or(false) || phone::is_group_jid(raw_phone),
    })
}

fn parse_status_callback(body: &Value) -> Vec<InboundEvent> {
    let Some(status) = body["status"].as_str().and_then(parse_status_name) else {
        return vec![InboundEvent::Ignored(format!(
            "status '{}'",
            body["status"].as_str().unwrap_or("")
        ))];
    };
    let ids: Vec<&str> = match body["ids"].as_array() {
        Some(ids) => ids.iter().filter_map(Value::as_str).collect(),
        None => str_at(body, "messageId").into_iter().collect(),
    };
    if ids.is_empty() {
        return vec![InboundEvent::Ignored("status callback without ids".into())];
    }
    ids.into_iter()
        .map(|id| {
            InboundEvent::Status(StatusUpdate {
                provider_message_id: id.to_string(),
                status,
            })
        })
        .collect()
}

/// Parse an aggregator webhook body. Pure.
pub fn parse_aggregator_webhook(body: &Value) -> Vec<InboundEvent> {
    match body["type"].as_str().unwrap_or("") {
        "ReceivedCallback" => vec![parse_received(body)],
        "MessageStatusCallback" => parse_status_callback(body),
        "ConnectedCallback" => vec![InboundEvent::Lifecycle(LifecycleEvent::Connected {
            phone_number: str_at(body, "phone")
                .map(phone::normalize)
                .filter(|p| !p.is_empty()),
        })],
        "DisconnectedCallback" => vec![InboundEvent::Lifecycle(LifecycleEvent::Disconnected)],
        "" => vec![InboundEvent::Ignored("webhook without type".into())],
        other => vec![InboundEvent::Ignored(format!("callback '{other}'"))],
    }
}

/// Endpoint path and JSON body for an outgoing message.
fn send_request(message: &OutgoingMessage) -> Result<(String, Value), RelayError> {
    let media = || {
        message.media_url.as_deref().ok_or_else(|| {
            RelayError::Channel(format!("{} message without media_url", message.kind.as_str()))
        })
    };
    Ok(match message.kind {
        MessageKind::Text => (
            "send-text".into(),
            json!({"phone": message.phone, "message": message.text}),
        ),
        MessageKind::Image => (
            "send-image".into(),
            json!({"phone": message.phone, "image": media()?, "caption": message.text}),
        ),
        MessageKind::Audio => (
            "send-audio".into(),
            json!({"phone": message.phone, "audio": media()?}),
        ),
        MessageKind::Video => (
            "send-video".into(),
            json!({"phone": message.phone, "video": media()?, "caption": message.text}),
        ),
        MessageKind::Sticker => (
            "send-sticker".into(),
            json!({"phone": message.phone, "sticker": media()?}),
        ),
        MessageKind::Document => {
            let url = media()?;
            let ext = url
                .rsplit('/')
                .next()
                .and_then(|file| file.rsplit_once('.'))
                .map(|(_, ext)| ext)
                .filter(|ext| !ext.is_empty() && ext.len() <= 5)
                .unwrap_or("pdf");
            (
                format!("send-document/{ext}"),
                json!({"phone": message.phone, "document": url, "caption": message.text}),
            )
        }
    })
}

#[async_trait]
impl MessagingProvider for AggregatorProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Aggregator
    }

    fn parse_webhook(&self, body: &Value) -> Vec<InboundEvent> {
        parse_aggregator_webhook(body)
    }

    async fn send(
        &self,
        instance: &Instance,
        message: &OutgoingMessage,
    ) -> Result<SendReceipt, RelayError> {
        let cfg = &instance.config;
        if cfg.api_url.is_empty() || cfg.remote_instance.is_empty() || cfg.api_token.is_empty() {
            return Err(RelayError::Channel(format!(
                "instance {} has no aggregator credentials",
                instance.id
            )));
        }
        let (endpoint, body) = send_request(message)?;
        let url = format!(
            "{}/instances/{}/token/{}/{endpoint}",
            cfg.api_url.trim_end_matches('/'),
            cfg.remote_instance,
            cfg.api_token
        );
        debug!("aggregator: POST {endpoint} for instance {}", instance.id);

        let mut req = self.client.post(&url).json(&body);
        if let Some(token) = cfg.client_token.as_deref().filter(|t| !t.is_empty()) {
            req = req.header("Client-Token", token);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| RelayError::Channel(format!("aggregator {endpoint} failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(RelayError::Channel(format!(
                "aggregator {endpoint} returned {status}: {text}"
            )));
        }

        let parsed: Value = resp.json().await.unwrap_or(Value::Null);
        Ok(SendReceipt {
            provider_message_id: str_at(&parsed, "messageId")
                .or_else(|| str_at(&parsed, "id"))
                .or_else(|| str_at(&parsed, "zaapId"))
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
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| RelayError::Channel(format!("media download failed: {e}")))?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn received(extra: Value) -> Value {
        let mut body = json!({
            "type": "ReceivedCallback",
            "instanceId": "3C01",
            "messageId": "A1B2",
            "phone": "5511999887766",
            "fromMe": false,
            "senderName": "Ana",
            "photo": "https://pps.whatsapp.net/ana.jpg",
            "isGroup": false
        });
        if let (Some(obj), Some(extra)) = (body.as_object_mut(), extra.as_object()) {
            for (k, v) in extra {
                obj.insert(k.clone(), v.clone());
            }
        }
        body
    }

    #[test]
    fn test_received_text() {
        let events = parse_aggregator_webhook(&received(json!({"text": {"message": "Olá"}})));
        match &events[0] {
            InboundEvent::Message(m) => {
                assert_eq!(m.provider_message_id, "A1B2");
                assert_eq!(m.phone, "5511999887766");
                assert_eq!(m.text, "Olá");
                assert_eq!(m.push_name.as_deref(), Some("Ana"));
                assert_eq!(m.profile_pic_url.as_deref(), Some("https://pps.whatsapp.net/ana.jpg"));
                assert_eq!(m.kind, MessageKind::Text);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_received_audio_is_plain_media() {
        let events = parse_aggregator_webhook(&received(json!({
            "audio": {"audioUrl": "https://storage/a.ogg", "mimeType": "audio/ogg; codecs=opus", "ptt": true}
        })));
        match &events[0] {
            InboundEvent::Message(m) => {
                assert_eq!(m.kind, MessageKind::Audio);
                let media = m.media.as_ref().unwrap();
                assert_eq!(media.url, "https://storage/a.ogg");
                assert!(media.media_key.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_received_without_content_ignored() {
        let events = parse_aggregator_webhook(&received(json!({})));
        assert!(matches!(events[0], InboundEvent::Ignored(_)));
    }

    #[test]
    fn test_status_callback_fans_out_ids() {
        let events = parse_aggregator_webhook(&json!({
            "type": "MessageStatusCallback",
            "status": "RECEIVED",
            "ids": ["m1", "m2"]
        }));
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[1],
            InboundEvent::Status(StatusUpdate {
                provider_message_id: "m2".into(),
                status: MessageStatus::Delivered,
            })
        );

        let read = parse_aggregator_webhook(&json!({
            "type": "MessageStatusCallback", "status": "READ", "ids": ["m1"]
        }));
        assert!(matches!(&read[0], InboundEvent::Status(s) if s.status == MessageStatus::Read));
    }

    #[test]
    fn test_connection_callbacks() {
        let up = parse_aggregator_webhook(&json!({"type": "ConnectedCallback", "phone": "5511988887777"}));
        assert_eq!(
            up[0],
            InboundEvent::Lifecycle(LifecycleEvent::Connected {
                phone_number: Some("5511988887777".into())
            })
        );
        let down = parse_aggregator_webhook(&json!({"type": "DisconnectedCallback"}));
        assert_eq!(down[0], InboundEvent::Lifecycle(LifecycleEvent::Disconnected));
        let other = parse_aggregator_webhook(&json!({"type": "PresenceChatCallback"}));
        assert!(matches!(other[0], InboundEvent::Ignored(_)));
    }

    #[test]
    fn test_send_request_shapes() {
        let (endpoint, body) = send_request(&OutgoingMessage::text("5511999887766", "Oi")).unwrap();
        assert_eq!(endpoint, "send-text");
        assert_eq!(body["message"], "Oi");

        let doc = OutgoingMessage {
            phone: "5511".into(),
            kind: MessageKind::Document,
            text: String::new(),
            media_url: Some("https://cdn/contrato.docx".into()),
        };
        let (endpoint, body) = send_request(&doc).unwrap();
        assert_eq!(endpoint, "send-document/docx");
        assert_eq!(body["document"], "https://cdn/contrato.docx");
    }
}
