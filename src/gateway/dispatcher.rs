//! Outbound dispatcher: send through the instance's provider, then record.

use super::Relay;
use chrono::Utc;
use tracing::{debug, info};
use zaprelay_core::{
    error::RelayError,
    message::OutgoingMessage,
    model::{
        Conversation, Direction, Instance, MessageKind, MessageMetadata, MessageOrigin,
        MessageRecord, MessageStatus, NewMessage,
    },
    phone,
};

/// An outbound send as requested through the HTTP API.
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub instance_id: String,
    pub phone: String,
    pub text: String,
    pub kind: MessageKind,
    pub media_url: Option<String>,
    pub conversation_id: Option<String>,
}

impl Relay {
    /// Send a message on a conversation and persist it as outgoing.
    ///
    /// Provider failures propagate: nothing is stored for a send that did
    /// not happen. Bot-authored sends stamp `last_bot_message_at` so the
    /// anti-loop guard sees them.
    pub(super) async fn dispatch(
        &self,
        instance: &Instance,
        conversation: &Conversation,
        phone_number: &str,
        message: OutgoingMessage,
        metadata: MessageMetadata,
    ) -> Result<MessageRecord, RelayError> {
        let provider = self.provider(instance.provider)?;
        let receipt = provider.send(instance, &message).await?;
        let origin = metadata.origin;
        debug!(
            "dispatch: {} -> {phone_number} via {} ({:?})",
            message.kind.as_str(),
            instance.provider.as_str(),
            receipt.provider_message_id
        );

        let record = self
            .store
            .insert_message(&NewMessage {
                conversation_id: conversation.id.clone(),
                instance_id: instance.id.clone(),
                direction: Direction::Outgoing,
                kind: message.kind,
                content: message.text.clone(),
                status: MessageStatus::Sent,
                media_url: message.media_url.clone(),
                transcription: None,
                is_bot: origin == Some(MessageOrigin::Bot),
                provider_message_id: receipt.provider_message_id.clone(),
                metadata,
            })
            .await?;

        if origin == Some(MessageOrigin::Bot) {
            // Reload: a flow may have changed the state since the caller read it.
            let mut state = self.store.get_conversation(&conversation.id).await?.bot_state;
            state.last_bot_message_at = Some(Utc::now());
            self.store.save_bot_state(&conversation.id, &state).await?;
        }
        self.store.touch_conversation(&conversation.id, false).await?;

        // A provider echo may already have stored this id; fetch that row.
        match record {
            Some(record) => Ok(record),
            None => {
                let id = receipt.provider_message_id.unwrap_or_default();
                self.store
                    .find_message_by_provider_id(&instance.id, &id)
                    .await?
                    .ok_or_else(|| RelayError::NotFound(format!("message {id}")))
            }
        }
    }

    /// Send a message requested through the API, creating contact and
    /// conversation as needed.
    pub async fn send_api_message(&self, request: SendRequest) -> Result<MessageRecord, RelayError> {
        let instance = self.store.get_instance(&request.instance_id).await?;
        let conversation = match &request.conversation_id {
            Some(id) => {
                let conversation = self.store.get_conversation(id).await?;
                if conversation.instance_id != instance.id {
                    return Err(RelayError::Conflict(format!(
                        "conversation {id} belongs to another instance"
                    )));
                }
                conversation
            }
            None => {
                let (contact, _) = self
                    .store
                    .upsert_contact(&instance.id, &request.phone, None, None)
                    .await?;
                self.store
                    .open_conversation(&instance.tenant_id, &instance.id, &contact.id)
                    .await?
            }
        };

        let phone_number = phone::normalize(&request.phone);
        if phone_number.is_empty() {
            return Err(RelayError::Config("phone_number is required".into()));
        }
        let message = OutgoingMessage {
            phone: phone_number.clone(),
            kind: request.kind,
            text: request.text,
            media_url: request.media_url,
        };
        let record = self
            .dispatch(
                &instance,
                &conversation,
                &phone_number,
                message,
                MessageMetadata {
                    origin: Some(MessageOrigin::Api),
                    ..Default::default()
                },
            )
            .await?;
        info!(
            "api send: {} to {phone_number} on instance {}",
            record.id, instance.id
        );
        Ok(record)
    }
}
