use super::*;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use zaprelay_core::{
    config::FlowConfig,
    context::ContextEntry,
    error::RelayError,
    flow::{Flow, TriggerType},
    traits::IntentClassifier,
};

// --- helpers ---

#[derive(Default)]
struct MockHost {
    calls: Mutex<Vec<String>>,
    fail_sends: bool,
}

impl MockHost {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
    fn push(&self, s: String) {
        self.calls.lock().unwrap().push(s);
    }
}

#[async_trait]
impl FlowHost for MockHost {
    async fn send_text(&self, text: &str) -> Result<(), RelayError> {
        self.push(format!("send:{text}"));
        if self.fail_sends {
            return Err(RelayError::Channel("gateway down".into()));
        }
        Ok(())
    }
    async fn respond_with_ai(&self, prompt: Option<&str>) -> Result<(), RelayError> {
        self.push(format!("ai:{}", prompt.unwrap_or("")));
        Ok(())
    }
    async fn transfer_to_human(&self, message: &str) -> Result<(), RelayError> {
        self.push(format!("human:{message}"));
        Ok(())
    }
    async fn transfer_to_ai(&self, message: Option<&str>) -> Result<(), RelayError> {
        self.push(format!("to_ai:{}", message.unwrap_or("")));
        Ok(())
    }
    async fn assign_department(&self, department: &str) -> Result<(), RelayError> {
        self.push(format!("dept:{department}"));
        Ok(())
    }
    async fn run_action(&self, name: &str, _payload: &Value) -> Result<(), RelayError> {
        self.push(format!("action:{name}"));
        Ok(())
    }
    async fn sleep(&self, duration: Duration) {
        self.push(format!("sleep:{}", duration.as_secs()));
    }
}

struct FixedClassifier {
    label: &'static str,
    calls: AtomicUsize,
}

#[async_trait]
impl IntentClassifier for FixedClassifier {
    async fn classify(
        &self,
        _message: &str,
        _history: &[ContextEntry],
        _vocabulary: &[String],
    ) -> Result<String, RelayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.label.to_string())
    }
}

fn flow(name: &str, trigger: TriggerType, value: &str, nodes: Value, edges: Value) -> Flow {
    Flow {
        id: name.to_string(),
        tenant_id: "t1".into(),
        name: name.to_string(),
        trigger_type: trigger,
        trigger_value: value.to_string(),
        intent_triggers: vec![],
        nodes: serde_json::from_value(nodes).unwrap(),
        edges: serde_json::from_value(edges).unwrap(),
        is_active: true,
        created_at: Utc::now(),
    }
}

fn n(id: &str, data: Value) -> Value {
    json!({"id": id, "type": "custom", "data": data})
}

fn e(source: &str, target: &str) -> Value {
    json!({"id": format!("{source}-{target}"), "source": source, "target": target})
}

fn eh(source: &str, target: &str, handle: &str) -> Value {
    json!({"id": format!("{source}-{target}"), "source": source, "target": target, "sourceHandle": handle})
}

fn greeting(name: &str, trigger: TriggerType, value: &str, text: &str) -> Flow {
    flow(
        name,
        trigger,
        value,
        json!([
            n("t", json!({"nodeType": "trigger"})),
            n("m", json!({"nodeType": "message", "text": text}))
        ]),
        json!([e("t", "m")]),
    )
}

fn engine() -> FlowEngine {
    FlowEngine::new(&FlowConfig::default())
}

fn input<'a>(text: &'a str, first: bool) -> SelectionInput<'a> {
    SelectionInput {
        text,
        is_first_message: first,
        history: &[],
    }
}

// --- selection ---

#[tokio::test]
async fn test_keyword_beats_all_messages() {
    let flows = vec![
        greeting("catch-all", TriggerType::AllMessages, "", "Olá!"),
        greeting("preco", TriggerType::Keyword, "preço, valor", "Nossos preços..."),
    ];
    let sel = select_flow(&flows, &input("Qual o PREÇO do corte?", false), None, &[]).await;
    assert_eq!(sel.flow.unwrap().name, "preco");
    assert_eq!(sel.matched_by, Some(TriggerType::Keyword));

    let sel = select_flow(&flows, &input("bom dia", false), None, &[]).await;
    assert_eq!(sel.flow.unwrap().name, "catch-all");
}

#[tokio::test]
async fn test_first_message_beats_keyword() {
    let flows = vec![
        greeting("preco", TriggerType::Keyword, "preço", "Nossos preços..."),
        greeting("welcome", TriggerType::FirstMessage, "", "Bem-vindo!"),
    ];
    let sel = select_flow(&flows, &input("qual o preço?", true), None, &[]).await;
    assert_eq!(sel.flow.unwrap().name, "welcome");

    let sel = select_flow(&flows, &input("qual o preço?", false), None, &[]).await;
    assert_eq!(sel.flow.unwrap().name, "preco");
}

#[tokio::test]
async fn test_inactive_flows_ignored() {
    let mut f = greeting("catch-all", TriggerType::AllMessages, "", "Olá!");
    f.is_active = false;
    let sel = select_flow(&[f], &input("oi", false), None, &[]).await;
    assert!(sel.flow.is_none());
}

#[tokio::test]
async fn test_intent_selection_persists_label() {
    let mut sales = greeting("vendas", TriggerType::Other, "", "Vamos falar de vendas");
    sales.intent_triggers = vec!["vendas".into()];
    let flows = vec![sales, greeting("catch-all", TriggerType::AllMessages, "", "Olá!")];

    let classifier = FixedClassifier {
        label: "Vendas",
        calls: AtomicUsize::new(0),
    };
    let sel = select_flow(&flows, &input("quero comprar", false), Some(&classifier), &[]).await;
    assert_eq!(sel.flow.unwrap().name, "vendas");
    assert_eq!(sel.detected_intent.as_deref(), Some("vendas"));

    let other = FixedClassifier {
        label: "suporte",
        calls: AtomicUsize::new(0),
    };
    let sel = select_flow(&flows, &input("deu erro", false), Some(&other), &[]).await;
    assert_eq!(sel.flow.unwrap().name, "catch-all");
    // Recorded even though nothing matched it.
    assert_eq!(sel.detected_intent.as_deref(), Some("suporte"));
}

#[tokio::test]
async fn test_classifier_skipped_without_intent_flows() {
    let flows = vec![greeting("catch-all", TriggerType::AllMessages, "", "Olá!")];
    let classifier = FixedClassifier {
        label: "vendas",
        calls: AtomicUsize::new(0),
    };
    let sel = select_flow(&flows, &input("oi", false), Some(&classifier), &[]).await;
    assert!(sel.detected_intent.is_none());
    assert_eq!(classifier.calls.load(Ordering::SeqCst), 0);
}

// --- execution ---

#[tokio::test]
async fn test_linear_flow() {
    let f = flow(
        "linear",
        TriggerType::AllMessages,
        "",
        json!([
            n("t", json!({"nodeType": "trigger"})),
            n("a", json!({"nodeType": "message", "text": "Olá!"})),
            n("b", json!({"nodeType": "delay", "seconds": 60})),
            n("c", json!({"nodeType": "ai_response"}))
        ]),
        json!([e("t", "a"), e("a", "b"), e("b", "c")]),
    );
    let host = MockHost::default();
    let out = engine().execute(&f, "oi", &host).await;
    assert_eq!(out.executed, 3);
    assert_eq!(out.end, FlowEnd::Completed);
    assert_eq!(out.last_node_id.as_deref(), Some("c"));
    // Delay capped at 10 s.
    assert_eq!(host.calls(), vec!["send:Olá!", "sleep:10", "ai:"]);
}

#[tokio::test]
async fn test_transfer_short_circuits() {
    let f = flow(
        "handoff",
        TriggerType::AllMessages,
        "",
        json!([
            n("t", json!({"nodeType": "trigger"})),
            n("h", json!({"nodeType": "transfer_to_human"})),
            n("after", json!({"nodeType": "message", "text": "never"}))
        ]),
        json!([e("t", "h"), e("h", "after")]),
    );
    let host = MockHost::default();
    let out = engine().execute(&f, "oi", &host).await;
    assert_eq!(out.end, FlowEnd::TransferredToHuman);
    assert_eq!(out.executed, 1);
    let calls = host.calls();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].starts_with("human:"));
    assert!(calls[0].len() > "human:".len(), "default handoff message used");
}

#[tokio::test]
async fn test_cycle_is_bounded() {
    let f = flow(
        "loop",
        TriggerType::AllMessages,
        "",
        json!([
            n("t", json!({"nodeType": "trigger"})),
            n("a", json!({"nodeType": "message", "text": "a"})),
            n("b", json!({"nodeType": "message", "text": "b"}))
        ]),
        json!([e("t", "a"), e("a", "b"), e("b", "a")]),
    );
    let host = MockHost::default();
    let out = engine().execute(&f, "oi", &host).await;
    assert_eq!(out.end, FlowEnd::NodeLimit);
    assert_eq!(out.executed, 20);
    assert_eq!(host.calls().len(), 20);
}

#[tokio::test]
async fn test_condition_branches() {
    let f = flow(
        "cond",
        TriggerType::AllMessages,
        "",
        json!([
            n("t", json!({"nodeType": "trigger"})),
            n("c", json!({"nodeType": "condition", "condition": "contains:sim"})),
            n("y", json!({"nodeType": "message", "text": "yes"})),
            n("no", json!({"nodeType": "message", "text": "no"}))
        ]),
        json!([e("t", "c"), eh("c", "no", "no"), eh("c", "y", "yes")]),
    );
    let host = MockHost::default();
    engine().execute(&f, "Sim, quero", &host).await;
    assert_eq!(host.calls(), vec!["send:yes"]);

    let host = MockHost::default();
    engine().execute(&f, "não", &host).await;
    assert_eq!(host.calls(), vec!["send:no"]);
}

#[tokio::test]
async fn test_condition_without_matching_handle_stops() {
    let f = flow(
        "cond",
        TriggerType::AllMessages,
        "",
        json!([
            n("t", json!({"nodeType": "trigger"})),
            n("c", json!({"nodeType": "condition", "condition": "equals:1"})),
            n("y", json!({"nodeType": "message", "text": "one"}))
        ]),
        json!([e("t", "c"), eh("c", "y", "yes")]),
    );
    let host = MockHost::default();
    let out = engine().execute(&f, "2", &host).await;
    assert_eq!(out.executed, 1);
    assert!(host.calls().is_empty());
}

#[tokio::test]
async fn test_missing_trigger_runs_nothing() {
    let f = flow(
        "broken",
        TriggerType::AllMessages,
        "",
        json!([n("a", json!({"nodeType": "message", "text": "x"}))]),
        json!([]),
    );
    let host = MockHost::default();
    let out = engine().execute(&f, "oi", &host).await;
    assert_eq!(out.executed, 0);
    assert!(host.calls().is_empty());
}

#[tokio::test]
async fn test_unknown_and_failing_nodes_continue() {
    let f = flow(
        "mixed",
        TriggerType::AllMessages,
        "",
        json!([
            n("t", json!({"nodeType": "trigger"})),
            n("x", json!({"nodeType": "carousel"})),
            n("m", json!({"nodeType": "message", "text": "hi"})),
            n("k", json!({"nodeType": "action", "action": "tag_lead"})),
            n("a", json!({"nodeType": "ai_response"}))
        ]),
        json!([e("t", "x"), e("x", "m"), e("m", "k"), e("k", "a")]),
    );
    let host = MockHost {
        fail_sends: true,
        ..Default::default()
    };
    let out = engine().execute(&f, "oi", &host).await;
    assert_eq!(out.executed, 4);
    assert_eq!(out.end, FlowEnd::Completed);
    assert_eq!(host.calls(), vec!["send:hi", "action:tag_lead", "ai:"]);
}

#[tokio::test]
async fn test_assign_department_ends_run() {
    let f = flow(
        "triage",
        TriggerType::AllMessages,
        "",
        json!([
            n("t", json!({"nodeType": "trigger"})),
            n("d", json!({"nodeType": "assign_department", "department": "vendas"})),
            n("after", json!({"nodeType": "message", "text": "never"}))
        ]),
        json!([e("t", "d"), e("d", "after")]),
    );
    let host = MockHost::default();
    let out = engine().execute(&f, "oi", &host).await;
    assert_eq!(out.end, FlowEnd::TransferredToHuman);
    assert_eq!(out.executed, 1);
    assert_eq!(out.last_node_id.as_deref(), Some("d"));
    assert_eq!(host.calls(), vec!["dept:vendas"]);
}

#[tokio::test]
async fn test_trigger_fans_out() {
    let f = flow(
        "fan",
        TriggerType::AllMessages,
        "",
        json!([
            n("t", json!({"nodeType": "trigger"})),
            n("a", json!({"nodeType": "message", "text": "a"})),
            n("b", json!({"nodeType": "transfer_to_ai", "message": "b"}))
        ]),
        json!([e("t", "a"), e("t", "b")]),
    );
    let host = MockHost::default();
    let out = engine().execute(&f, "oi", &host).await;
    assert_eq!(out.executed, 2);
    assert_eq!(host.calls(), vec!["send:a", "to_ai:b"]);
}
