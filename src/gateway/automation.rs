//! Automation for one inbound message: flow selection, flow execution, and
//! the AI fallback.

use super::Relay;
use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};
use zaprelay_core::{
    context::{Context, ContextEntry},
    error::RelayError,
    message::OutgoingMessage,
    model::{
        BotState, Conversation, ConversationStatus, Instance, MessageMetadata, MessageOrigin,
        MessageRecord,
    },
};
use zaprelay_flows::{select_flow, FlowHost, SelectionInput};

/// The inbound message automation answers.
pub(super) struct Trigger<'a> {
    pub instance: &'a Instance,
    pub conversation: &'a Conversation,
    pub phone: &'a str,
    /// Text, caption, or transcript.
    pub text: &'a str,
    pub image_url: Option<&'a str>,
    /// Id of the stored inbound message, left out of the history.
    pub message_id: &'a str,
    pub is_first_message: bool,
}

/// What automation did with a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutomationResult {
    Flow { name: String, executed: usize },
    Ai,
}

impl Relay {
    /// Select and run a flow, or fall back to the AI responder.
    pub(super) async fn run_automation(
        &self,
        trigger: &Trigger<'_>,
    ) -> Result<AutomationResult, RelayError> {
        let conversation = trigger.conversation;

        // --- 1. LOAD FLOWS AND HISTORY ---
        let flows = self.store.active_flows(&conversation.tenant_id).await?;
        let history: Vec<MessageRecord> = self
            .store
            .recent_messages(&conversation.id, self.flow_config.history_messages + 1)
            .await?
            .into_iter()
            .filter(|m| m.id != trigger.message_id)
            .collect();
        let entries: Vec<ContextEntry> = history.iter().map(ContextEntry::from_record).collect();

        // --- 2. SELECT ---
        let selection = select_flow(
            &flows,
            &SelectionInput {
                text: trigger.text,
                is_first_message: trigger.is_first_message,
                history: &entries,
            },
            self.classifier.as_deref(),
            &self.flow_config.intents,
        )
        .await;

        if let Some(intent) = &selection.detected_intent {
            self.update_bot_state(&conversation.id, |s| {
                s.detected_intent = Some(intent.clone());
                s.intent_detected_at = Some(Utc::now());
            })
            .await?;
        }

        let host = ConversationHost {
            relay: self,
            trigger,
            history: &history,
        };

        // --- 3. EXECUTE OR FALL BACK ---
        match selection.flow {
            Some(flow) if !flow.nodes.is_empty() => {
                info!(
                    "conversation {}: running flow '{}' ({:?})",
                    conversation.id, flow.name, selection.matched_by
                );
                self.update_bot_state(&conversation.id, |s| {
                    s.active_flow_id = Some(flow.id.clone());
                    s.current_node_id = None;
                })
                .await?;

                let outcome = self.engine.execute(&flow, trigger.text, &host).await;

                self.update_bot_state(&conversation.id, |s| {
                    s.current_node_id = outcome.last_node_id.clone();
                    s.last_flow_run_at = Some(Utc::now());
                })
                .await?;
                debug!(
                    "flow '{}' ended {:?} after {} nodes",
                    flow.name, outcome.end, outcome.executed
                );
                Ok(AutomationResult::Flow {
                    name: flow.name,
                    executed: outcome.executed,
                })
            }
            _ => {
                host.respond_with_ai(None).await?;
                Ok(AutomationResult::Ai)
            }
        }
    }

    /// Reload, modify, and save a conversation's bot state.
    pub(super) async fn update_bot_state(
        &self,
        conversation_id: &str,
        apply: impl FnOnce(&mut BotState),
    ) -> Result<(), RelayError> {
        let mut state = self.store.get_conversation(conversation_id).await?.bot_state;
        apply(&mut state);
        self.store.save_bot_state(conversation_id, &state).await
    }
}

/// Flow side effects applied to one conversation.
struct ConversationHost<'a> {
    relay: &'a Relay,
    trigger: &'a Trigger<'a>,
    history: &'a [MessageRecord],
}

impl ConversationHost<'_> {
    fn conversation_id(&self) -> &str {
        &self.trigger.conversation.id
    }

    async fn send_bot_text(&self, text: &str) -> Result<(), RelayError> {
        // Attendance may have changed mid-flow; dispatch reads the latest row.
        let conversation = self.relay.store.get_conversation(self.conversation_id()).await?;
        self.relay
            .dispatch(
                self.trigger.instance,
                &conversation,
                self.trigger.phone,
                OutgoingMessage::text(self.trigger.phone, text),
                MessageMetadata {
                    origin: Some(MessageOrigin::Bot),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl FlowHost for ConversationHost<'_> {
    async fn send_text(&self, text: &str) -> Result<(), RelayError> {
        self.send_bot_text(text).await
    }

    async fn respond_with_ai(&self, prompt: Option<&str>) -> Result<(), RelayError> {
        let Some(responder) = &self.relay.responder else {
            debug!(
                "conversation {}: no AI responder configured, staying silent",
                self.conversation_id()
            );
            return Ok(());
        };

        let system_prompt = match prompt {
            Some(p) if !p.trim().is_empty() => format!("{}\n\n{p}", self.relay.system_prompt),
            _ => self.relay.system_prompt.clone(),
        };
        let mut context = Context::new(&system_prompt, self.trigger.text).with_history(self.history);
        context.image_url = self.trigger.image_url.map(String::from);

        let reply = responder.complete(&context).await?;
        if reply.trim().is_empty() {
            debug!("{} returned an empty reply", responder.name());
            return Ok(());
        }
        self.send_bot_text(reply.trim()).await
    }

    async fn transfer_to_human(&self, message: &str) -> Result<(), RelayError> {
        let current = self.relay.store.get_conversation(self.conversation_id()).await?;
        self.relay
            .store
            .set_attendance(
                self.conversation_id(),
                &current.attendance.transfer_to_human(),
                Some(ConversationStatus::WaitingHuman),
            )
            .await?;
        info!("conversation {}: transferred to human", self.conversation_id());
        if !message.trim().is_empty() {
            self.send_bot_text(message).await?;
        }
        Ok(())
    }

    async fn transfer_to_ai(&self, message: Option<&str>) -> Result<(), RelayError> {
        let current = self.relay.store.get_conversation(self.conversation_id()).await?;
        self.relay
            .store
            .set_attendance(
                self.conversation_id(),
                &current.attendance.return_to_ai(),
                Some(ConversationStatus::InProgress),
            )
            .await?;
        match message.filter(|m| !m.trim().is_empty()) {
            Some(m) => self.send_bot_text(m).await,
            None => Ok(()),
        }
    }

    async fn assign_department(&self, department: &str) -> Result<(), RelayError> {
        let current = self.relay.store.get_conversation(self.conversation_id()).await?;
        self.relay
            .store
            .set_department(self.conversation_id(), department)
            .await?;
        self.relay
            .store
            .set_attendance(
                self.conversation_id(),
                &current.attendance.transfer_to_human(),
                Some(ConversationStatus::WaitingHuman),
            )
            .await?;
        info!(
            "conversation {}: assigned to department '{department}'",
            self.conversation_id()
        );
        Ok(())
    }

    async fn run_action(&self, name: &str, payload: &serde_json::Value) -> Result<(), RelayError> {
        warn!(
            "conversation {}: flow action '{name}' has no handler: {payload}",
            self.conversation_id()
        );
        Ok(())
    }
}
