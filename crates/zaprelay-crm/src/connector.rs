//! Open-channel connector operations: registration, line activation, event
//! binding, message forwarding and delivery receipts.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};
use zaprelay_core::{
    config::CrmConfig,
    error::RelayError,
    model::{Integration, IntegrationConfig, MessageStatus},
    traits::{CrmApi, CrmChatRef, CrmInbound, CrmReceipt},
};
use zaprelay_store::Store;

use crate::{client::CrmRpc, token::TokenRefresher};

/// Events the relay subscribes to on every integration.
pub const BOUND_EVENTS: &[&str] = &[
    "ONIMCONNECTORMESSAGEADD",
    "ONIMCONNECTORLINEDELETE",
    "ONIMCONNECTORSTATUSDELETE",
];

const CONNECTOR_ICON: &str = "data:image/svg+xml;charset=US-ASCII,%3Csvg%20xmlns%3D%22http%3A%2F%2Fwww.w3.org%2F2000%2Fsvg%22%20viewBox%3D%220%200%2070%2071%22%3E%3Ccircle%20cx%3D%2235%22%20cy%3D%2235%22%20r%3D%2230%22%20fill%3D%22%2325D366%22%2F%3E%3C%2Fsvg%3E";

/// CRM client used by the pipeline.
pub struct CrmClient {
    rpc: CrmRpc,
    config: CrmConfig,
    public_url: String,
}

impl CrmClient {
    /// `public_url` is where the CRM reaches our webhooks.
    pub fn new(store: Store, config: CrmConfig, public_url: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .unwrap_or_default();
        let tokens = TokenRefresher::new(store.clone(), config.clone());
        Self {
            rpc: CrmRpc::new(client, store, tokens),
            config,
            public_url: public_url.trim_end_matches('/').to_string(),
        }
    }

    /// Event handler URL for one tenant.
    pub fn handler_url(&self, tenant_id: &str) -> String {
        format!("{}/webhooks/crm/{tenant_id}", self.public_url)
    }

    async fn update_flags(
        &self,
        integration_id: &str,
        apply: impl FnOnce(&mut IntegrationConfig),
    ) -> Result<(), RelayError> {
        let store = self.rpc.store();
        let mut config = store.get_integration(integration_id).await?.config;
        apply(&mut config);
        store.update_integration_config(integration_id, &config).await
    }
}

/// `imconnector.send.messages` parameters for one inbound message.
pub fn send_messages_params(connector: &str, message: &CrmInbound) -> Value {
    let mut body = json!({
        "id": message.provider_message_id,
        "date": Utc::now().timestamp(),
        "text": message.text,
    });
    if let Some(url) = &message.media_url {
        body["files"] = json!([{ "url": url }]);
    }
    json!({
        "CONNECTOR": connector,
        "LINE": message.line_id,
        "MESSAGES": [{
            "user": {
                "id": message.phone,
                "name": message.contact_name.clone().unwrap_or_else(|| message.phone.clone()),
                "phone": message.phone,
            },
            "message": body,
            "chat": { "id": message.phone },
        }],
    })
}

/// Pull the CRM chat/user/message ids out of a `send.messages` result.
pub fn parse_chat_ref(result: &Value) -> CrmChatRef {
    let first = result
        .pointer("/DATA/RESULT/0")
        .or_else(|| result.pointer("/RESULT/0"))
        .unwrap_or(&Value::Null);
    let as_id = |v: Option<&Value>| -> Option<String> {
        match v? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    };
    CrmChatRef {
        chat_id: as_id(first.pointer("/session/CHAT_ID"))
            .or_else(|| as_id(first.pointer("/chat/id"))),
        user_id: as_id(first.get("user")),
        message_id: as_id(first.pointer("/message/0"))
            .or_else(|| as_id(first.get("message"))),
    }
}

/// Receipt method for a status, if the CRM has one.
pub fn receipt_method(status: MessageStatus) -> Option<&'static str> {
    match status {
        MessageStatus::Delivered => Some("imconnector.send.status.delivery"),
        MessageStatus::Read => Some("imconnector.send.status.reading"),
        MessageStatus::Sent | MessageStatus::Received => None,
    }
}

/// Parameters for a delivery/read receipt.
pub fn receipt_params(connector: &str, receipt: &CrmReceipt) -> Value {
    let messages: Vec<Value> = receipt
        .crm_message_ids
        .iter()
        .map(|crm_id| {
            json!({
                "im": { "chat_id": receipt.crm_chat_id, "message_id": crm_id },
                "message": { "id": receipt.provider_message_ids },
                "chat": { "id": receipt.external_chat_id },
            })
        })
        .collect();
    json!({
        "CONNECTOR": connector,
        "LINE": receipt.line_id,
        "MESSAGES": messages,
    })
}

#[async_trait]
impl CrmApi for CrmClient {
    async fn forward_inbound(
        &self,
        integration: &Integration,
        message: &CrmInbound,
    ) -> Result<CrmChatRef, RelayError> {
        let params = send_messages_params(&self.config.connector_id, message);
        let result = self
            .rpc
            .call(integration, "imconnector.send.messages", &params)
            .await?;
        let chat = parse_chat_ref(&result);
        debug!(
            "crm: forwarded {} to line {} (chat {:?})",
            message.provider_message_id, message.line_id, chat.chat_id
        );
        Ok(chat)
    }

    async fn send_receipt(
        &self,
        integration: &Integration,
        receipt: &CrmReceipt,
    ) -> Result<(), RelayError> {
        let Some(method) = receipt_method(receipt.status) else {
            return Ok(());
        };
        if receipt.crm_message_ids.is_empty() {
            debug!("crm: receipt without CRM message ids, skipped");
            return Ok(());
        }
        let params = receipt_params(&self.config.connector_id, receipt);
        self.rpc.call(integration, method, &params).await?;
        Ok(())
    }

    async fn register_connector(&self, integration: &Integration) -> Result<(), RelayError> {
        let params = json!({
            "ID": self.config.connector_id,
            "NAME": self.config.connector_name,
            "ICON": { "DATA_IMAGE": CONNECTOR_ICON },
            "PLACEMENT_HANDLER": self.handler_url(&integration.tenant_id),
        });
        self.rpc
            .call(integration, "imconnector.register", &params)
            .await?;
        let bound = self.rebind_events(integration).await?;
        self.update_flags(&integration.id, |c| c.connector_registered = true)
            .await?;
        info!(
            "crm: connector '{}' registered for tenant {} ({bound} events bound)",
            self.config.connector_id, integration.tenant_id
        );
        Ok(())
    }

    async fn set_line_active(
        &self,
        integration: &Integration,
        line_id: i64,
        active: bool,
    ) -> Result<(), RelayError> {
        let params = json!({
            "CONNECTOR": self.config.connector_id,
            "LINE": line_id,
            "ACTIVE": if active { "1" } else { "0" },
        });
        self.rpc
            .call(integration, "imconnector.activate", &params)
            .await?;
        self.update_flags(&integration.id, |c| {
            c.activated_lines.retain(|l| *l != line_id);
            if active {
                c.activated_lines.push(line_id);
                c.activated_lines.sort_unstable();
            }
        })
        .await?;
        info!(
            "crm: line {line_id} {} for tenant {}",
            if active { "activated" } else { "deactivated" },
            integration.tenant_id
        );
        Ok(())
    }

    async fn rebind_events(&self, integration: &Integration) -> Result<usize, RelayError> {
        let handler = self.handler_url(&integration.tenant_id);
        let mut bound = 0;
        for event in BOUND_EVENTS {
            let params = json!({ "event": event, "handler": handler });
            if let Err(e) = self.rpc.call(integration, "event.unbind", &params).await {
                debug!("crm: unbind {event} failed (ignored): {e}");
            }
            match self.rpc.call(integration, "event.bind", &params).await {
                Ok(_) => bound += 1,
                Err(e @ RelayError::CrmAuth(_)) => return Err(e),
                Err(e) => warn!("crm: bind {event} failed: {e}"),
            }
        }
        Ok(bound)
    }
}
