//! CRM event handlers run by the queue worker.
//!
//! Operator messages go out through the dispatcher; connector lifecycle
//! events become CRM RPC calls. Unknown event types complete without work.

use super::Relay;
use serde_json::Value;
use tracing::{debug, info, warn};
use zaprelay_core::{
    error::RelayError,
    message::OutgoingMessage,
    model::{
        ConversationStatus, IdentityCandidates, Instance, Integration, MessageKind,
        MessageMetadata, MessageOrigin, MessageStatus, QueueEntry,
    },
    traits::CrmReceipt,
};

/// A file attached to an operator message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperatorFile {
    pub url: String,
    pub kind: MessageKind,
    pub name: Option<String>,
}

/// One message an operator sent from the CRM.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperatorMessage {
    /// Our chat id as the CRM knows it (the contact's phone).
    pub external_chat_id: String,
    pub crm_chat_id: Option<String>,
    pub crm_message_id: Option<String>,
    pub text: String,
    pub files: Vec<OperatorFile>,
}

/// A CRM event, decoded from its queue entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrmEvent {
    OperatorMessage {
        line_id: i64,
        messages: Vec<OperatorMessage>,
    },
    BotMessage,
    BotJoinChat,
    /// The connector settings page toggled a line. `None` when the
    /// callback named no line.
    ConnectorSettings {
        line_id: Option<i64>,
        active: bool,
    },
    /// Re-register every event subscription (after a handler URL change).
    Rebind,
    LineDelete {
        line_id: i64,
    },
    StatusDelete {
        line_id: Option<i64>,
    },
    Unknown(String),
}

/// Integer from a number or a numeric string.
fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Non-empty string from a string or number.
fn as_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Elements of a list that may arrive as an array or as an index-keyed object.
///
/// Index keys sort numerically; non-numeric keys follow in key order.
fn items(value: &Value) -> Vec<&Value> {
    match value {
        Value::Array(list) => list.iter().collect(),
        Value::Object(map) => {
            let mut keyed: Vec<(Option<usize>, &String, &Value)> = map
                .iter()
                .map(|(key, item)| (key.trim().parse().ok(), key, item))
                .collect();
            keyed.sort_by(|a, b| match (a.0, b.0) {
                (Some(x), Some(y)) => x.cmp(&y),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => a.1.cmp(b.1),
            });
            keyed.into_iter().map(|(_, _, item)| item).collect()
        }
        _ => Vec::new(),
    }
}

/// `PLACEMENT_OPTIONS` arrives either as an object or as a JSON string.
fn placement_options(payload: &Value) -> Value {
    match &payload["PLACEMENT_OPTIONS"] {
        Value::String(raw) => serde_json::from_str(raw).unwrap_or(Value::Null),
        other => other.clone(),
    }
}

/// Whether a generic placement callback came from the connector settings page.
fn is_connector_placement(payload: &Value) -> bool {
    payload["PLACEMENT"]
        .as_str()
        .is_some_and(|p| p.trim().to_ascii_uppercase().starts_with("SETTING_CONNECTOR"))
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_i64().unwrap_or(0) != 0,
        Value::String(s) => matches!(s.trim().to_ascii_uppercase().as_str(), "1" | "Y" | "TRUE"),
        _ => false,
    }
}

fn parse_operator_message(raw: &Value) -> OperatorMessage {
    let files = items(&raw["message"]["files"])
        .into_iter()
        .filter_map(|f| {
            let url = as_id(&f["link"]).or_else(|| as_id(&f["url"]))?;
            Some(OperatorFile {
                url,
                kind: MessageKind::parse_lenient(f["type"].as_str().unwrap_or("file")),
                name: as_id(&f["name"]),
            })
        })
        .collect();
    let crm_message_id = match &raw["im"]["message_id"] {
        Value::Null => items(&raw["message"]["id"]).first().and_then(|v| as_id(v)),
        other => as_id(other),
    };
    OperatorMessage {
        external_chat_id: as_id(&raw["chat"]["id"]).unwrap_or_default(),
        crm_chat_id: as_id(&raw["im"]["chat_id"]),
        crm_message_id,
        text: raw["message"]["text"].as_str().unwrap_or("").to_string(),
        files,
    }
}

impl CrmEvent {
    /// Decode a stored event. Missing fields default rather than fail.
    pub fn parse(event_type: &str, payload: &Value) -> Self {
        let data = &payload["data"];
        match event_type.trim().to_ascii_uppercase().as_str() {
            "ONIMCONNECTORMESSAGEADD" => Self::OperatorMessage {
                line_id: as_i64(&data["LINE"]).unwrap_or(0),
                messages: items(&data["MESSAGES"])
                    .into_iter()
                    .map(parse_operator_message)
                    .collect(),
            },
            "ONIMBOTMESSAGEADD" => Self::BotMessage,
            "ONIMBOTJOINCHAT" => Self::BotJoinChat,
            "PLACEMENT" if !is_connector_placement(payload) => Self::Unknown("PLACEMENT".into()),
            kind if kind == "PLACEMENT" || kind.starts_with("SETTING_CONNECTOR") => {
                let options = placement_options(payload);
                Self::ConnectorSettings {
                    line_id: as_i64(&options["LINE"]),
                    active: truthy(&options["ACTIVE_STATUS"]),
                }
            }
            "REBIND_EVENTS" | "REBIND" => Self::Rebind,
            "ONIMCONNECTORLINEDELETE" => Self::LineDelete {
                line_id: as_i64(&data["LINE"])
                    .or_else(|| as_i64(data))
                    .unwrap_or(0),
            },
            "ONIMCONNECTORSTATUSDELETE" => Self::StatusDelete {
                line_id: as_i64(&data["LINE"]),
            },
            other => Self::Unknown(other.to_string()),
        }
    }
}

/// Convert the CRM's chat markup to WhatsApp text.
pub fn clean_markup(text: &str) -> String {
    let mut out = text
        .replace("[br]", "\n")
        .replace("[BR]", "\n")
        .replace("[b]", "*")
        .replace("[/b]", "*")
        .replace("[B]", "*")
        .replace("[/B]", "*")
        .replace("[i]", "_")
        .replace("[/i]", "_")
        .replace("[s]", "~")
        .replace("[/s]", "~");
    while let Some(start) = out.find("[url=") {
        let Some(close) = out[start..].find(']') else {
            break;
        };
        out.replace_range(start..start + close + 1, "");
    }
    out.replace("[/url]", "").trim().to_string()
}

impl Relay {
    /// Handle one claimed queue entry.
    pub(super) async fn handle_crm_event(&self, entry: &QueueEntry) -> Result<(), RelayError> {
        let tenant_id = entry.tenant_id.as_str();
        match CrmEvent::parse(&entry.event_type, &entry.payload) {
            CrmEvent::OperatorMessage { line_id, messages } => {
                self.relay_operator_messages(tenant_id, line_id, &messages)
                    .await
            }
            CrmEvent::BotMessage | CrmEvent::BotJoinChat => {
                info!("crm: {} for tenant {tenant_id} (no handler)", entry.event_type);
                Ok(())
            }
            CrmEvent::ConnectorSettings { line_id, active } => {
                let Some(line_id) = line_id else {
                    warn!("crm: connector settings for tenant {tenant_id} named no line, ignored");
                    return Ok(());
                };
                let Some(integration) = self.integration_for(tenant_id).await? else {
                    return Ok(());
                };
                self.crm
                    .set_line_active(&integration, line_id, active)
                    .await
            }
            CrmEvent::Rebind => {
                let Some(integration) = self.integration_for(tenant_id).await? else {
                    return Ok(());
                };
                let bound = self.crm.rebind_events(&integration).await?;
                info!("crm: rebound {bound} events for tenant {tenant_id}");
                Ok(())
            }
            CrmEvent::LineDelete { line_id } => {
                if self.store.deactivate_line(tenant_id, line_id).await? {
                    info!("crm: line {line_id} deleted, mapping deactivated");
                }
                Ok(())
            }
            CrmEvent::StatusDelete { line_id } => {
                let Some(integration) = self.integration_for(tenant_id).await? else {
                    return Ok(());
                };
                let mut config = integration.config;
                match line_id {
                    Some(line) => config.activated_lines.retain(|l| *l != line),
                    None => {
                        config.connector_registered = false;
                        config.activated_lines.clear();
                    }
                }
                self.store
                    .update_integration_config(&integration.id, &config)
                    .await?;
                info!("crm: connector status cleared for tenant {tenant_id} ({line_id:?})");
                Ok(())
            }
            CrmEvent::Unknown(event_type) => {
                info!("crm: unknown event '{event_type}' for tenant {tenant_id}, completed");
                Ok(())
            }
        }
    }

    /// The tenant's active CRM integration. Missing is logged, not an error.
    async fn integration_for(&self, tenant_id: &str) -> Result<Option<Integration>, RelayError> {
        let integration = self
            .store
            .active_integration(tenant_id, zaprelay_crm::PLATFORM)
            .await?;
        if integration.is_none() {
            warn!("crm: tenant {tenant_id} has no active integration, event dropped");
        }
        Ok(integration)
    }

    /// The instance serving a CRM line: its mapping, or the tenant's only instance.
    async fn instance_for_line(
        &self,
        tenant_id: &str,
        line_id: i64,
    ) -> Result<Option<Instance>, RelayError> {
        if let Some(mapping) = self.store.active_mapping_for_line(tenant_id, line_id).await? {
            return self.store.get_instance(&mapping.instance_id).await.map(Some);
        }
        let sole = self.store.sole_instance(tenant_id).await?;
        if let Some(instance) = &sole {
            debug!("crm: line {line_id} unmapped, using sole instance {}", instance.id);
        }
        Ok(sole)
    }

    async fn relay_operator_messages(
        &self,
        tenant_id: &str,
        line_id: i64,
        messages: &[OperatorMessage],
    ) -> Result<(), RelayError> {
        let Some(instance) = self.instance_for_line(tenant_id, line_id).await? else {
            warn!("crm: no instance for line {line_id} of tenant {tenant_id}, dropped");
            return Ok(());
        };
        let integration = self
            .store
            .active_integration(tenant_id, zaprelay_crm::PLATFORM)
            .await?;

        for message in messages {
            self.relay_operator_message(&instance, integration.as_ref(), line_id, message)
                .await?;
        }
        Ok(())
    }

    async fn relay_operator_message(
        &self,
        instance: &Instance,
        integration: Option<&Integration>,
        line_id: i64,
        message: &OperatorMessage,
    ) -> Result<(), RelayError> {
        // --- 1. IDENTITY ---
        let candidates = IdentityCandidates {
            phone: Some(message.external_chat_id.clone()).filter(|p| !p.is_empty()),
            remote_user_id: None,
            remote_chat_id: message.crm_chat_id.clone(),
        };
        let Some(contact) = self.store.resolve_contact(&instance.id, &candidates).await? else {
            warn!(
                "crm: no contact for chat {:?} / {:?} on instance {}, dropped",
                message.external_chat_id, message.crm_chat_id, instance.id
            );
            return Ok(());
        };

        // --- 2. CONVERSATION ---
        let conversation = self
            .store
            .open_conversation(&instance.tenant_id, &instance.id, &contact.id)
            .await?;

        // --- 3. DISPATCH ---
        let metadata = MessageMetadata {
            origin: Some(MessageOrigin::Crm),
            crm_message_id: message.crm_message_id.clone(),
            crm_chat_id: message.crm_chat_id.clone(),
            ..Default::default()
        };
        let mut outgoing = Vec::new();
        let text = clean_markup(&message.text);
        if !text.is_empty() {
            outgoing.push(OutgoingMessage::text(&contact.phone, &text));
        }
        for file in &message.files {
            outgoing.push(OutgoingMessage {
                phone: contact.phone.clone(),
                kind: file.kind,
                text: file.name.clone().unwrap_or_default(),
                media_url: Some(file.url.clone()),
            });
        }
        if outgoing.is_empty() {
            debug!("crm: empty operator message for {}, skipped", contact.phone);
            return Ok(());
        }

        let mut provider_ids = Vec::new();
        for out in outgoing {
            let record = self
                .dispatch(instance, &conversation, &contact.phone, out, metadata.clone())
                .await?;
            provider_ids.extend(record.provider_message_id);
        }
        info!(
            "crm: operator message relayed to {} on instance {}",
            contact.phone, instance.id
        );

        // --- 4. RECEIPT & IDENTITY TAG ---
        if let (Some(integration), Some(crm_chat_id)) = (integration, &message.crm_chat_id) {
            let receipt = CrmReceipt {
                line_id,
                status: MessageStatus::Delivered,
                crm_chat_id: crm_chat_id.clone(),
                crm_message_ids: message.crm_message_id.clone().into_iter().collect(),
                external_chat_id: message.external_chat_id.clone(),
                provider_message_ids: provider_ids,
            };
            self.best_effort(
                "crm_receipt",
                &conversation.id,
                self.crm.send_receipt(integration, &receipt),
            )
            .await;
            self.best_effort(
                "contact_tag",
                &contact.id,
                self.store.tag_contact(&contact.id, None, Some(crm_chat_id)),
            )
            .await;
        }

        // --- 5. ATTENDANCE ---
        if let Some(next) = conversation.attendance.infer_takeover() {
            self.store
                .set_attendance(&conversation.id, &next, Some(ConversationStatus::InProgress))
                .await?;
            info!("conversation {}: operator replied from the CRM, human takeover", conversation.id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_operator_message() {
        let payload = json!({
            "event": "ONIMCONNECTORMESSAGEADD",
            "data": {
                "CONNECTOR": "zaprelay_whatsapp",
                "LINE": "5",
                "MESSAGES": [{
                    "im": {"chat_id": "777", "message_id": "1001"},
                    "message": {"id": ["1001"], "text": "Olá!"},
                    "chat": {"id": "5511999887766"}
                }]
            }
        });
        let event = CrmEvent::parse("ONIMCONNECTORMESSAGEADD", &payload);
        let CrmEvent::OperatorMessage { line_id, messages } = event else {
            panic!("expected operator message");
        };
        assert_eq!(line_id, 5);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].external_chat_id, "5511999887766");
        assert_eq!(messages[0].crm_chat_id.as_deref(), Some("777"));
        assert_eq!(messages[0].crm_message_id.as_deref(), Some("1001"));
        assert_eq!(messages[0].text, "Olá!");
    }

    #[test]
    fn test_parse_index_keyed_messages_and_files() {
        let payload = json!({
            "data": {
                "LINE": 2,
                "MESSAGES": {"0": {
                    "im": {"chat_id": 9},
                    "message": {
                        "id": {"0": 55},
                        "text": "",
                        "files": {"0": {"link": "https://crm.example/f.pdf", "type": "file", "name": "f.pdf"}}
                    },
                    "chat": {"id": "5511"}
                }}
            }
        });
        let CrmEvent::OperatorMessage { messages, .. } =
            CrmEvent::parse("onimconnectormessageadd", &payload)
        else {
            panic!("expected operator message");
        };
        assert_eq!(messages[0].crm_message_id.as_deref(), Some("55"));
        assert_eq!(messages[0].crm_chat_id.as_deref(), Some("9"));
        assert_eq!(
            messages[0].files,
            vec![OperatorFile {
                url: "https://crm.example/f.pdf".into(),
                kind: MessageKind::Document,
                name: Some("f.pdf".into()),
            }]
        );
    }

    #[test]
    fn test_parse_placement_options_string() {
        let payload = json!({
            "PLACEMENT": "SETTING_CONNECTOR",
            "PLACEMENT_OPTIONS": "{\"LINE\":\"5\",\"ACTIVE_STATUS\":1}"
        });
        assert_eq!(
            CrmEvent::parse("PLACEMENT", &payload),
            CrmEvent::ConnectorSettings {
                line_id: Some(5),
                active: true
            }
        );
        let off = json!({"PLACEMENT_OPTIONS": {"LINE": 5, "ACTIVE_STATUS": "0"}});
        assert_eq!(
            CrmEvent::parse("SETTING_CONNECTOR", &off),
            CrmEvent::ConnectorSettings {
                line_id: Some(5),
                active: false
            }
        );
    }

    #[test]
    fn test_parse_placement_without_line() {
        let generic = json!({"PLACEMENT": "DEFAULT", "PLACEMENT_OPTIONS": {}});
        assert_eq!(
            CrmEvent::parse("PLACEMENT", &generic),
            CrmEvent::Unknown("PLACEMENT".into())
        );
        let empty = json!({"PLACEMENT": "SETTING_CONNECTOR", "PLACEMENT_OPTIONS": "{}"});
        assert_eq!(
            CrmEvent::parse("SETTING_CONNECTOR", &empty),
            CrmEvent::ConnectorSettings {
                line_id: None,
                active: false
            }
        );
    }

    #[test]
    fn test_items_index_keys_sort_numerically() {
        let list = json!({"10": "k", "2": "c", "0": "a", "1": "b", "extra": "z"});
        let got: Vec<&str> = items(&list).into_iter().filter_map(Value::as_str).collect();
        assert_eq!(got, vec!["a", "b", "c", "k", "z"]);
    }

    #[test]
    fn test_parse_other_events() {
        assert_eq!(CrmEvent::parse("ONIMBOTJOINCHAT", &Value::Null), CrmEvent::BotJoinChat);
        assert_eq!(CrmEvent::parse("REBIND_EVENTS", &Value::Null), CrmEvent::Rebind);
        assert_eq!(
            CrmEvent::parse("ONIMCONNECTORLINEDELETE", &json!({"data": {"LINE": 3}})),
            CrmEvent::LineDelete { line_id: 3 }
        );
        assert_eq!(
            CrmEvent::parse("ONCRMDEALADD", &Value::Null),
            CrmEvent::Unknown("ONCRMDEALADD".into())
        );
    }

    #[test]
    fn test_clean_markup() {
        assert_eq!(clean_markup("[b]Ana:[/b][br]Olá!"), "*Ana:*\nOlá!");
        assert_eq!(
            clean_markup("veja [url=https://x.example]aqui[/url]"),
            "veja aqui"
        );
        assert_eq!(clean_markup("  texto  "), "texto");
    }
}
