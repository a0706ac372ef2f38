//! Inbound pipeline for provider webhooks: normalize, dedupe, persist,
//! gate, automate.

use super::{automation::Trigger, Relay};
use chrono::{Duration, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};
use zaprelay_core::{
    attendance::should_auto_process,
    error::RelayError,
    message::{InboundEvent, InboundMessage, LifecycleEvent, StatusUpdate},
    model::{
        Contact, Conversation, Direction, Instance, InstanceStatus, MessageKind, MessageMetadata,
        MessageOrigin, MessageRecord, MessageStatus, NewMessage, ProviderKind,
    },
    phone,
    traits::{CrmInbound, CrmReceipt},
};

/// Counts of what one webhook body contained.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct WebhookSummary {
    pub messages: usize,
    pub duplicates: usize,
    pub statuses: usize,
    pub lifecycle: usize,
    pub ignored: usize,
}

/// Result of ingesting one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ingested {
    Stored,
    Duplicate,
    Skipped,
}

/// Durable media and transcript for one inbound message.
#[derive(Debug, Default)]
struct MediaResult {
    url: Option<String>,
    transcription: Option<String>,
    mime_type: Option<String>,
}

impl Relay {
    /// Process one provider webhook for an instance.
    ///
    /// Errors mean the body could not be applied and the provider should
    /// redeliver; redelivery is safe because ingestion is idempotent.
    pub async fn handle_provider_webhook(
        &self,
        kind: ProviderKind,
        instance_id: &str,
        body: &Value,
    ) -> Result<WebhookSummary, RelayError> {
        let instance = self.store.get_instance(instance_id).await?;
        if instance.provider != kind {
            return Err(RelayError::Conflict(format!(
                "instance {instance_id} is a {} instance, not {}",
                instance.provider.as_str(),
                kind.as_str()
            )));
        }

        let events = self.provider(kind)?.parse_webhook(body);
        let mut summary = WebhookSummary::default();
        for event in events {
            match event {
                InboundEvent::Message(message) => match self.ingest_message(&instance, message).await? {
                    Ingested::Stored => summary.messages += 1,
                    Ingested::Duplicate => summary.duplicates += 1,
                    Ingested::Skipped => summary.ignored += 1,
                },
                InboundEvent::Status(update) => {
                    self.apply_status(&instance, &update).await?;
                    summary.statuses += 1;
                }
                InboundEvent::Lifecycle(lifecycle) => {
                    self.apply_lifecycle(&instance, lifecycle).await?;
                    summary.lifecycle += 1;
                }
                InboundEvent::Ignored(reason) => {
                    debug!("[{}] webhook ignored: {reason}", instance.id);
                    summary.ignored += 1;
                }
            }
        }
        Ok(summary)
    }

    async fn ingest_message(
        &self,
        instance: &Instance,
        message: InboundMessage,
    ) -> Result<Ingested, RelayError> {
        // --- 1. FILTER ---
        if message.is_group {
            debug!("[{}] group message {} skipped", instance.id, message.provider_message_id);
            return Ok(Ingested::Skipped);
        }
        let phone_number = phone::normalize(&message.phone);
        if phone_number.is_empty() || message.provider_message_id.is_empty() {
            warn!("[{}] message without phone or id skipped", instance.id);
            return Ok(Ingested::Skipped);
        }

        // --- 2. DEDUPE ---
        if self
            .store
            .find_message_by_provider_id(&instance.id, &message.provider_message_id)
            .await?
            .is_some()
        {
            debug!("[{}] duplicate {}", instance.id, message.provider_message_id);
            return Ok(Ingested::Duplicate);
        }

        // --- 3. CONTACT & CONVERSATION ---
        // Echoes carry our own push name, not the contact's.
        let push_name = if message.from_me { None } else { message.push_name.as_deref() };
        let (contact, created) = self
            .store
            .upsert_contact(
                &instance.id,
                &phone_number,
                push_name,
                message.profile_pic_url.as_deref(),
            )
            .await?;
        if created {
            info!("[{}] new contact {phone_number}", instance.id);
        }
        let conversation = self
            .store
            .open_conversation(&instance.tenant_id, &instance.id, &contact.id)
            .await?;

        if message.from_me {
            return self.record_device_echo(instance, &conversation, &message).await;
        }

        // --- 4. MEDIA ---
        let media = self.ingest_media(instance, &message).await;
        let text = match &media.transcription {
            Some(t) if message.text.trim().is_empty() => t.clone(),
            _ => message.text.clone(),
        };

        // --- 5. STORE ---
        let Some(record) = self
            .store
            .insert_message(&NewMessage {
                conversation_id: conversation.id.clone(),
                instance_id: instance.id.clone(),
                direction: Direction::Incoming,
                kind: message.kind,
                content: message.text.clone(),
                status: MessageStatus::Received,
                media_url: media.url.clone(),
                transcription: media.transcription.clone(),
                is_bot: false,
                provider_message_id: Some(message.provider_message_id.clone()),
                metadata: MessageMetadata {
                    mime_type: media.mime_type.clone(),
                    ..Default::default()
                },
            })
            .await?
        else {
            return Ok(Ingested::Duplicate);
        };
        info!(
            "[{}] {} from {phone_number}: {}",
            instance.id,
            message.kind.as_str(),
            preview(&text)
        );

        // --- 6. CRM FORWARD ---
        self.best_effort(
            "crm_forward",
            &record.id,
            self.forward_to_crm(instance, &contact, &record, &text),
        )
        .await;

        // --- 7. GATE ---
        let is_first_message = self.store.count_incoming_from_contact(&contact.id).await? == 1;
        let conversation = self.store.get_conversation(&conversation.id).await?;
        if !should_auto_process(&conversation, Utc::now(), self.flow_config.anti_loop_secs) {
            debug!(
                "conversation {}: {} mode, automation skipped",
                conversation.id,
                conversation.attendance.mode_str()
            );
            self.store.touch_conversation(&conversation.id, true).await?;
            return Ok(Ingested::Stored);
        }
        self.store.touch_conversation(&conversation.id, false).await?;

        // --- 8. AUTOMATION ---
        if text.trim().is_empty() && media.url.is_none() {
            debug!("conversation {}: nothing to answer", conversation.id);
            return Ok(Ingested::Stored);
        }
        let trigger = Trigger {
            instance,
            conversation: &conversation,
            phone: &phone_number,
            text: &text,
            image_url: (message.kind == MessageKind::Image)
                .then_some(media.url.as_deref())
                .flatten(),
            message_id: &record.id,
            is_first_message,
        };
        if let Some(result) = self
            .best_effort("automation", &conversation.id, self.run_automation(&trigger))
            .await
        {
            debug!("conversation {}: automation {result:?}", conversation.id);
        }
        Ok(Ingested::Stored)
    }

    /// Store an outgoing message typed on the phone and infer a takeover.
    ///
    /// An echo inside the anti-loop window is taken to be our own send whose
    /// provider id has not been recorded yet, so it does not hand over.
    async fn record_device_echo(
        &self,
        instance: &Instance,
        conversation: &Conversation,
        message: &InboundMessage,
    ) -> Result<Ingested, RelayError> {
        let inserted = self
            .store
            .insert_message(&NewMessage {
                conversation_id: conversation.id.clone(),
                instance_id: instance.id.clone(),
                direction: Direction::Outgoing,
                kind: message.kind,
                content: message.text.clone(),
                status: MessageStatus::Sent,
                media_url: message.media.as_ref().map(|m| m.url.clone()),
                transcription: None,
                is_bot: false,
                provider_message_id: Some(message.provider_message_id.clone()),
                metadata: MessageMetadata {
                    origin: Some(MessageOrigin::Device),
                    ..Default::default()
                },
            })
            .await?;
        if inserted.is_none() {
            return Ok(Ingested::Duplicate);
        }
        self.store.touch_conversation(&conversation.id, false).await?;

        let window = Duration::seconds(self.flow_config.anti_loop_secs);
        let own_echo = conversation
            .bot_state
            .last_bot_message_at
            .is_some_and(|at| Utc::now() - at < window);
        if own_echo {
            debug!("conversation {}: echo of a bot send", conversation.id);
            return Ok(Ingested::Stored);
        }

        if let Some(next) = conversation.attendance.infer_takeover() {
            self.store.set_attendance(&conversation.id, &next, None).await?;
            info!(
                "conversation {}: reply sent from the phone, human takeover",
                conversation.id
            );
        }
        Ok(Ingested::Stored)
    }

    /// Download, persist, and (for audio) transcribe an attachment. Every
    /// step is best-effort.
    async fn ingest_media(&self, instance: &Instance, message: &InboundMessage) -> MediaResult {
        let Some(media_ref) = &message.media else {
            return MediaResult::default();
        };
        let reference = &message.provider_message_id;
        let mime_type = media_ref
            .mime_type
            .clone()
            .unwrap_or_else(|| default_mime(message.kind).to_string());
        let mut result = MediaResult {
            mime_type: Some(mime_type.clone()),
            ..Default::default()
        };

        let Ok(provider) = self.provider(instance.provider) else {
            return result;
        };
        let Some(bytes) = self
            .best_effort("media_fetch", reference, provider.fetch_media(instance, media_ref))
            .await
        else {
            return result;
        };

        result.url = self
            .best_effort("media_store", reference, self.media.store(&bytes, &mime_type))
            .await;

        if message.kind == MessageKind::Audio {
            if let Some(transcriber) = &self.transcriber {
                result.transcription = self
                    .best_effort(
                        "transcription",
                        reference,
                        transcriber.transcribe(bytes, &mime_type),
                    )
                    .await
                    .map(|t| t.trim().to_string())
                    .filter(|t| !t.is_empty());
            }
        }
        result
    }

    /// Forward an inbound message to the CRM line mapped to the instance.
    async fn forward_to_crm(
        &self,
        instance: &Instance,
        contact: &Contact,
        record: &MessageRecord,
        text: &str,
    ) -> Result<(), RelayError> {
        let Some(mapping) = self.store.active_mapping_for_instance(&instance.id).await? else {
            return Ok(());
        };
        let Some(integration) = self
            .store
            .active_integration(&instance.tenant_id, zaprelay_crm::PLATFORM)
            .await?
        else {
            debug!("tenant {} has a mapping but no integration", instance.tenant_id);
            return Ok(());
        };

        let text = if text.trim().is_empty() {
            format!("[{}]", record.kind.as_str())
        } else {
            text.to_string()
        };
        let chat = self
            .crm
            .forward_inbound(
                &integration,
                &CrmInbound {
                    line_id: mapping.line_id,
                    phone: contact.phone.clone(),
                    contact_name: contact.name.clone(),
                    provider_message_id: record.provider_message_id.clone().unwrap_or_default(),
                    text,
                    media_url: record.media_url.clone(),
                },
            )
            .await?;

        self.store
            .tag_contact(&contact.id, chat.user_id.as_deref(), chat.chat_id.as_deref())
            .await?;
        let mut metadata = record.metadata.clone();
        metadata.crm_chat_id = chat.chat_id;
        metadata.crm_message_id = chat.message_id;
        self.store.set_message_metadata(&record.id, &metadata).await
    }

    async fn apply_status(&self, instance: &Instance, update: &StatusUpdate) -> Result<(), RelayError> {
        let Some(record) = self
            .store
            .advance_message_status(&instance.id, &update.provider_message_id, update.status)
            .await?
        else {
            debug!(
                "[{}] status {} for {} not applied",
                instance.id,
                update.status.as_str(),
                update.provider_message_id
            );
            return Ok(());
        };

        if record.metadata.origin == Some(MessageOrigin::Crm) {
            self.best_effort("crm_receipt", &record.id, self.relay_receipt(instance, &record))
                .await;
        }
        Ok(())
    }

    /// Tell the CRM an operator message was delivered or read.
    async fn relay_receipt(&self, instance: &Instance, record: &MessageRecord) -> Result<(), RelayError> {
        let (Some(crm_chat_id), Some(crm_message_id)) = (
            record.metadata.crm_chat_id.clone(),
            record.metadata.crm_message_id.clone(),
        ) else {
            return Ok(());
        };
        let Some(mapping) = self.store.active_mapping_for_instance(&instance.id).await? else {
            return Ok(());
        };
        let Some(integration) = self
            .store
            .active_integration(&instance.tenant_id, zaprelay_crm::PLATFORM)
            .await?
        else {
            return Ok(());
        };
        let conversation = self.store.get_conversation(&record.conversation_id).await?;
        let contact = self.store.get_contact(&conversation.contact_id).await?;

        self.crm
            .send_receipt(
                &integration,
                &CrmReceipt {
                    line_id: mapping.line_id,
                    status: record.status,
                    crm_chat_id,
                    crm_message_ids: vec![crm_message_id],
                    external_chat_id: contact.phone,
                    provider_message_ids: record.provider_message_id.clone().into_iter().collect(),
                },
            )
            .await
    }

    async fn apply_lifecycle(
        &self,
        instance: &Instance,
        event: LifecycleEvent,
    ) -> Result<(), RelayError> {
        match event {
            LifecycleEvent::Qr { code } => {
                self.store
                    .set_instance_status(&instance.id, InstanceStatus::QrPending, Some(&code), None)
                    .await?;
                info!("[{}] QR code updated", instance.id);
            }
            LifecycleEvent::Connected { phone_number } => {
                self.store
                    .set_instance_status(
                        &instance.id,
                        InstanceStatus::Connected,
                        None,
                        phone_number.as_deref(),
                    )
                    .await?;
                info!("[{}] connected", instance.id);
            }
            LifecycleEvent::Disconnected => {
                self.store
                    .set_instance_status(&instance.id, InstanceStatus::Disconnected, None, None)
                    .await?;
                warn!("[{}] disconnected", instance.id);
            }
        }
        Ok(())
    }
}

fn default_mime(kind: MessageKind) -> &'static str {
    match kind {
        MessageKind::Image => "image/jpeg",
        MessageKind::Audio => "audio/ogg",
        MessageKind::Video => "video/mp4",
        MessageKind::Sticker => "image/webp",
        MessageKind::Document | MessageKind::Text => "application/octet-stream",
    }
}

/// First 60 characters of a message, for logs.
fn preview(text: &str) -> String {
    if text.chars().count() > 60 {
        let truncated: String = text.chars().take(60).collect();
        format!("{truncated}...")
    } else {
        text.to_string()
    }
}
