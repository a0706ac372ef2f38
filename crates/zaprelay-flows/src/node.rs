//! Executable node types parsed from authored flow nodes.

use serde_json::Value;
use zaprelay_core::flow::FlowNode;

/// A flow node reduced to what the interpreter needs.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    Trigger,
    Message { text: String },
    AiResponse { prompt: Option<String> },
    Delay { secs: u64 },
    Condition { expr: String },
    Action { name: String, payload: Value },
    TransferToHuman { message: Option<String> },
    TransferToAi { message: Option<String> },
    AssignDepartment { department: String },
    /// Unrecognized type tag; skipped at run time.
    Unknown(String),
}

impl NodeKind {
    pub fn parse(node: &FlowNode) -> Self {
        let text_of = |keys: &[&str]| keys.iter().find_map(|k| node.data_text(k));

        match node.type_tag() {
            "trigger" | "start" => Self::Trigger,
            "message" | "send_message" => Self::Message {
                text: text_of(&["text", "message", "content"]).unwrap_or_default(),
            },
            "ai_response" | "ai" => Self::AiResponse {
                prompt: text_of(&["prompt", "instructions"]),
            },
            "delay" | "wait" => Self::Delay {
                secs: ["seconds", "delay", "duration"]
                    .iter()
                    .find_map(|k| node.data_u64(k))
                    .unwrap_or(0),
            },
            "condition" => Self::Condition {
                expr: text_of(&["condition", "expression"]).unwrap_or_default(),
            },
            "action" => Self::Action {
                name: text_of(&["action", "name"]).unwrap_or_else(|| "unnamed".to_string()),
                payload: node.data.clone(),
            },
            "transfer_to_human" | "handoff" => Self::TransferToHuman {
                message: text_of(&["message", "text"]),
            },
            "transfer_to_ai" => Self::TransferToAi {
                message: text_of(&["message", "text"]),
            },
            "assign_department" => match text_of(&["department", "departmentName"]) {
                Some(department) => Self::AssignDepartment { department },
                None => Self::Unknown("assign_department (no department)".to_string()),
            },
            other => Self::Unknown(other.to_string()),
        }
    }
}

/// Evaluate a condition against the inbound text.
///
/// Supports `contains:<word>` and `equals:<value>`, both case-insensitive.
/// Anything else evaluates to true.
pub fn evaluate_condition(expr: &str, text: &str) -> bool {
    let text = text.trim().to_lowercase();
    let expr = expr.trim();
    if let Some(word) = strip_prefix_ci(expr, "contains:") {
        return text.contains(&word.trim().to_lowercase());
    }
    if let Some(value) = strip_prefix_ci(expr, "equals:") {
        return text == value.trim().to_lowercase();
    }
    true
}

fn strip_prefix_ci<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let head = s.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        Some(&s[prefix.len()..])
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(data: Value) -> FlowNode {
        serde_json::from_value(json!({"id": "n", "type": "custom", "data": data})).unwrap()
    }

    #[test]
    fn test_parse_known_kinds() {
        assert_eq!(
            NodeKind::parse(&node(json!({"nodeType": "message", "text": " Olá! "}))),
            NodeKind::Message { text: "Olá!".into() }
        );
        assert_eq!(
            NodeKind::parse(&node(json!({"nodeType": "delay", "seconds": 3}))),
            NodeKind::Delay { secs: 3 }
        );
        assert_eq!(
            NodeKind::parse(&node(json!({"nodeType": "transfer_to_human"}))),
            NodeKind::TransferToHuman { message: None }
        );
        assert_eq!(
            NodeKind::parse(&node(json!({"nodeType": "assign_department", "department": "vendas"}))),
            NodeKind::AssignDepartment { department: "vendas".into() }
        );
    }

    #[test]
    fn test_parse_unknown() {
        assert_eq!(
            NodeKind::parse(&node(json!({"nodeType": "carousel"}))),
            NodeKind::Unknown("carousel".into())
        );
        assert!(matches!(
            NodeKind::parse(&node(json!({"nodeType": "assign_department"}))),
            NodeKind::Unknown(_)
        ));
    }

    #[test]
    fn test_conditions() {
        assert!(evaluate_condition("contains:preço", "Qual o PREÇO?"));
        assert!(!evaluate_condition("contains:preço", "bom dia"));
        assert!(evaluate_condition("equals:sim", "  SIM "));
        assert!(!evaluate_condition("equals:sim", "sim, claro"));
        assert!(evaluate_condition("Contains:oi", "oi"));
        assert!(evaluate_condition("regex:^a", "zzz"));
        assert!(evaluate_condition("", "zzz"));
    }
}
