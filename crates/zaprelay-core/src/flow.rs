//! Stored automation flows: a trigger rule plus a graph of typed nodes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How a flow is selected for an inbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    FirstMessage,
    Keyword,
    Intent,
    AllMessages,
    /// Never auto-selected (e.g. `manual`, or a type added later).
    #[serde(other)]
    Other,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FirstMessage => "first_message",
            Self::Keyword => "keyword",
            Self::Intent => "intent",
            Self::AllMessages => "all_messages",
            Self::Other => "other",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "first_message" => Self::FirstMessage,
            "keyword" => Self::Keyword,
            "intent" => Self::Intent,
            "all_messages" => Self::AllMessages,
            _ => Self::Other,
        }
    }
}

/// One graph node as authored in the flow builder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowNode {
    pub id: String,
    /// Builder-level node type (often just `"custom"`); the executable type
    /// usually lives in `data.nodeType`.
    #[serde(rename = "type", default)]
    pub node_type: String,
    #[serde(default)]
    pub data: Value,
}

impl FlowNode {
    /// Executable node type: `data.nodeType` first, then the top-level `type`.
    pub fn type_tag(&self) -> &str {
        self.data
            .get("nodeType")
            .and_then(Value::as_str)
            .unwrap_or(self.node_type.as_str())
    }

    /// Trimmed, non-empty string field from `data`.
    pub fn data_text(&self, key: &str) -> Option<String> {
        self.data
            .get(key)
            .and_then(Value::as_str)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    /// Numeric field from `data`, accepting numbers and numeric strings.
    pub fn data_u64(&self, key: &str) -> Option<u64> {
        match self.data.get(key)? {
            Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f.max(0.0) as u64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

/// A directed edge; `source_handle` distinguishes condition branches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowEdge {
    #[serde(default)]
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(rename = "sourceHandle", alias = "source_handle", default)]
    pub source_handle: Option<String>,
}

/// An automation flow scoped to a tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub trigger_type: TriggerType,
    /// Comma-separated keywords for `keyword` flows.
    pub trigger_value: String,
    pub intent_triggers: Vec<String>,
    pub nodes: Vec<FlowNode>,
    pub edges: Vec<FlowEdge>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_type_tag_prefers_data() {
        let node: FlowNode = serde_json::from_value(json!({
            "id": "n1", "type": "custom", "data": {"nodeType": "message", "text": "oi"}
        }))
        .unwrap();
        assert_eq!(node.type_tag(), "message");

        let bare: FlowNode = serde_json::from_value(json!({"id": "n2", "type": "delay"})).unwrap();
        assert_eq!(bare.type_tag(), "delay");
    }

    #[test]
    fn test_data_u64_accepts_strings() {
        let node: FlowNode =
            serde_json::from_value(json!({"id": "d", "data": {"seconds": "7", "x": 2.5}})).unwrap();
        assert_eq!(node.data_u64("seconds"), Some(7));
        assert_eq!(node.data_u64("x"), Some(2));
        assert_eq!(node.data_u64("missing"), None);
    }

    #[test]
    fn test_edge_handle_aliases() {
        let a: FlowEdge =
            serde_json::from_value(json!({"source": "a", "target": "b", "sourceHandle": "yes"}))
                .unwrap();
        let b: FlowEdge =
            serde_json::from_value(json!({"source": "a", "target": "b", "source_handle": "no"}))
                .unwrap();
        assert_eq!(a.source_handle.as_deref(), Some("yes"));
        assert_eq!(b.source_handle.as_deref(), Some("no"));
    }
}
