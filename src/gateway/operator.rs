//! Operator-facing actions exposed through the HTTP API.

use super::Relay;
use tracing::info;
use zaprelay_core::{
    error::RelayError,
    model::{ChannelMapping, Conversation, ConversationStatus, Integration},
};

impl Relay {
    /// Explicit takeover: the operator answers, automation goes silent.
    pub async fn take_over(
        &self,
        conversation_id: &str,
        operator: Option<String>,
    ) -> Result<Conversation, RelayError> {
        let conversation = self.store.get_conversation(conversation_id).await?;
        let next = conversation.attendance.take_over(operator);
        self.store
            .set_attendance(conversation_id, &next, Some(ConversationStatus::InProgress))
            .await?;
        info!(
            "conversation {conversation_id}: taken over by {}",
            next.assigned_to().unwrap_or("unassigned operator")
        );
        self.store.get_conversation(conversation_id).await
    }

    /// Return the conversation to automation.
    pub async fn release(&self, conversation_id: &str) -> Result<Conversation, RelayError> {
        let conversation = self.store.get_conversation(conversation_id).await?;
        self.store
            .set_attendance(
                conversation_id,
                &conversation.attendance.return_to_ai(),
                Some(ConversationStatus::InProgress),
            )
            .await?;
        info!("conversation {conversation_id}: returned to AI");
        self.store.get_conversation(conversation_id).await
    }

    pub async fn mark_read(&self, conversation_id: &str) -> Result<(), RelayError> {
        self.store.mark_conversation_read(conversation_id).await
    }

    /// Map an instance to a CRM line, then activate the line best-effort.
    pub async fn create_mapping(
        &self,
        tenant_id: &str,
        instance_id: &str,
        line_id: i64,
    ) -> Result<ChannelMapping, RelayError> {
        let instance = self.store.get_instance(instance_id).await?;
        if instance.tenant_id != tenant_id {
            return Err(RelayError::Conflict(format!(
                "instance {instance_id} belongs to another tenant"
            )));
        }
        let mapping = self
            .store
            .create_channel_mapping(tenant_id, instance_id, line_id)
            .await?;
        info!("mapping: instance {instance_id} <-> line {line_id} (tenant {tenant_id})");

        if let Some(integration) = self
            .store
            .active_integration(tenant_id, zaprelay_crm::PLATFORM)
            .await?
        {
            self.best_effort(
                "line_activate",
                &mapping.id,
                self.crm.set_line_active(&integration, line_id, true),
            )
            .await;
        }
        Ok(mapping)
    }

    /// Register the connector for an integration and return the updated row.
    pub async fn register_connector(&self, integration_id: &str) -> Result<Integration, RelayError> {
        let integration = self.store.get_integration(integration_id).await?;
        if !integration.is_active {
            return Err(RelayError::Conflict(format!(
                "integration {integration_id} is inactive"
            )));
        }
        self.crm.register_connector(&integration).await?;
        self.store.get_integration(integration_id).await
    }

    /// The instance's pending QR code, if any.
    pub async fn instance_qr(&self, instance_id: &str) -> Result<Option<String>, RelayError> {
        Ok(self.store.get_instance(instance_id).await?.qr_code)
    }
}
