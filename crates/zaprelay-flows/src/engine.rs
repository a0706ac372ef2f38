//! Graph interpreter.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tracing::{debug, info, warn};
use zaprelay_core::{
    config::FlowConfig,
    error::RelayError,
    flow::{Flow, FlowEdge},
};

use crate::node::{evaluate_condition, NodeKind};

/// Side effects a flow run may perform on its conversation.
///
/// The engine decides *what* happens; the host does it (send through the
/// dispatcher, persist attendance changes, call the AI responder).
#[async_trait]
pub trait FlowHost: Send + Sync {
    async fn send_text(&self, text: &str) -> Result<(), RelayError>;

    /// Answer with the generic AI responder, optionally steered by a node prompt.
    async fn respond_with_ai(&self, prompt: Option<&str>) -> Result<(), RelayError>;

    /// Set attendance to human / `waiting_human` and send the handoff message.
    async fn transfer_to_human(&self, message: &str) -> Result<(), RelayError>;

    /// Return to AI, clearing the assignment, with an optional message.
    async fn transfer_to_ai(&self, message: Option<&str>) -> Result<(), RelayError>;

    /// Tag a department and hand the conversation to a human.
    async fn assign_department(&self, department: &str) -> Result<(), RelayError>;

    /// Opaque action hook.
    async fn run_action(&self, name: &str, payload: &Value) -> Result<(), RelayError> {
        info!("flow action '{name}' (no handler): {payload}");
        Ok(())
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowEnd {
    /// Frontier exhausted.
    Completed,
    /// A `transfer_to_human` or `assign_department` node ended the run.
    TransferredToHuman,
    /// Stopped at the node bound.
    NodeLimit,
}

/// Result of one flow run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    /// Nodes executed, not counting the trigger.
    pub executed: usize,
    pub last_node_id: Option<String>,
    pub end: FlowEnd,
}

/// Bounds and defaults for flow runs.
#[derive(Debug, Clone)]
pub struct FlowEngine {
    pub max_nodes: usize,
    pub max_delay: Duration,
    pub handoff_message: String,
}

impl FlowEngine {
    pub fn new(config: &FlowConfig) -> Self {
        Self {
            max_nodes: config.max_nodes,
            max_delay: Duration::from_secs(config.max_delay_secs),
            handoff_message: config.handoff_message.clone(),
        }
    }

    /// Run a flow for one inbound message.
    ///
    /// Starts at the targets of the trigger node's edges. Non-branching nodes
    /// follow their first outgoing edge; conditions follow the `yes`/`no`
    /// handle (or an unlabeled edge). A node that fails is logged and the run
    /// continues. Always terminates: at most `max_nodes` executions.
    pub async fn execute(&self, flow: &Flow, text: &str, host: &dyn FlowHost) -> ExecutionOutcome {
        let mut outcome = ExecutionOutcome {
            executed: 0,
            last_node_id: None,
            end: FlowEnd::Completed,
        };

        let nodes: HashMap<&str, NodeKind> = flow
            .nodes
            .iter()
            .map(|n| (n.id.as_str(), NodeKind::parse(n)))
            .collect();
        let mut outgoing: HashMap<&str, Vec<&FlowEdge>> = HashMap::new();
        for edge in &flow.edges {
            outgoing.entry(edge.source.as_str()).or_default().push(edge);
        }

        let Some(trigger) = flow
            .nodes
            .iter()
            .find(|n| matches!(nodes.get(n.id.as_str()), Some(NodeKind::Trigger)))
        else {
            warn!("flow '{}' has no trigger node, nothing to run", flow.name);
            return outcome;
        };

        let mut frontier: VecDeque<&str> = outgoing
            .get(trigger.id.as_str())
            .map(|edges| edges.iter().map(|e| e.target.as_str()).collect())
            .unwrap_or_default();

        while let Some(node_id) = frontier.pop_front() {
            if outcome.executed >= self.max_nodes {
                warn!(
                    "flow '{}' hit the {} node bound, stopping",
                    flow.name, self.max_nodes
                );
                outcome.end = FlowEnd::NodeLimit;
                break;
            }
            let Some(kind) = nodes.get(node_id) else {
                warn!("flow '{}' edge points at missing node {node_id}", flow.name);
                continue;
            };

            outcome.executed += 1;
            outcome.last_node_id = Some(node_id.to_string());
            let edges = outgoing.get(node_id).map(Vec::as_slice).unwrap_or(&[]);

            let step = match kind {
                NodeKind::Trigger => Ok(()),
                NodeKind::Message { text } if text.is_empty() => {
                    debug!("flow node {node_id}: empty message, skipped");
                    Ok(())
                }
                NodeKind::Message { text } => host.send_text(text).await,
                NodeKind::AiResponse { prompt } => host.respond_with_ai(prompt.as_deref()).await,
                NodeKind::Delay { secs } => {
                    let wait = Duration::from_secs(*secs).min(self.max_delay);
                    host.sleep(wait).await;
                    Ok(())
                }
                NodeKind::Condition { expr } => {
                    let result = evaluate_condition(expr, text);
                    let handle = if result { "yes" } else { "no" };
                    debug!("flow node {node_id}: condition '{expr}' -> {handle}");
                    let next = edges
                        .iter()
                        .find(|e| e.source_handle.as_deref() == Some(handle))
                        .or_else(|| edges.iter().find(|e| e.source_handle.is_none()));
                    if let Some(edge) = next {
                        frontier.push_back(edge.target.as_str());
                    }
                    continue;
                }
                NodeKind::Action { name, payload } => host.run_action(name, payload).await,
                NodeKind::TransferToHuman { message } => {
                    let message = message.as_deref().unwrap_or(&self.handoff_message);
                    if let Err(e) = host.transfer_to_human(message).await {
                        warn!("flow node {node_id}: transfer_to_human failed: {e}");
                    }
                    outcome.end = FlowEnd::TransferredToHuman;
                    return outcome;
                }
                NodeKind::TransferToAi { message } => host.transfer_to_ai(message.as_deref()).await,
                NodeKind::AssignDepartment { department } => {
                    if let Err(e) = host.assign_department(department).await {
                        warn!("flow node {node_id}: assign_department failed: {e}");
                    }
                    outcome.end = FlowEnd::TransferredToHuman;
                    return outcome;
                }
                NodeKind::Unknown(tag) => {
                    info!("flow node {node_id}: unknown type '{tag}', skipped");
                    Ok(())
                }
            };

            if let Err(e) = step {
                warn!("flow node {node_id} failed, continuing: {e}");
            }
            if let Some(edge) = edges.first() {
                frontier.push_back(edge.target.as_str());
            }
        }

        outcome
    }
}
