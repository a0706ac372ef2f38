//! Flow selection for an inbound message.

use tracing::{debug, warn};
use zaprelay_core::{
    context::ContextEntry,
    flow::{Flow, TriggerType},
    traits::IntentClassifier,
};

/// Inputs to flow selection.
pub struct SelectionInput<'a> {
    pub text: &'a str,
    /// The contact has never written before this message.
    pub is_first_message: bool,
    pub history: &'a [ContextEntry],
}

/// Result of flow selection.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub flow: Option<Flow>,
    /// Which rule matched.
    pub matched_by: Option<TriggerType>,
    /// Label from the intent classifier, when it ran.
    pub detected_intent: Option<String>,
}

/// Keywords of a `keyword` flow: comma-separated, trimmed, lowercased.
pub fn keywords(flow: &Flow) -> Vec<String> {
    flow.trigger_value
        .split(',')
        .map(|k| k.trim().to_lowercase())
        .filter(|k| !k.is_empty())
        .collect()
}

/// Intent labels a flow answers to.
pub fn intent_labels(flow: &Flow) -> Vec<String> {
    let mut labels: Vec<String> = flow
        .intent_triggers
        .iter()
        .map(|l| l.trim().to_lowercase())
        .filter(|l| !l.is_empty())
        .collect();
    if flow.trigger_type == TriggerType::Intent {
        labels.extend(keywords(flow));
    }
    labels
}

fn matches_keyword(flow: &Flow, text_lower: &str) -> bool {
    flow.trigger_type == TriggerType::Keyword
        && keywords(flow).iter().any(|k| text_lower.contains(k.as_str()))
}

/// Pick the flow for a message. First match wins:
/// `first_message`, then `keyword`, then intent, then `all_messages`.
///
/// The classifier runs only when some flow declares intent labels; its label
/// is reported even when no flow matches it. Classifier errors skip the
/// intent step.
pub async fn select_flow(
    flows: &[Flow],
    input: &SelectionInput<'_>,
    classifier: Option<&dyn IntentClassifier>,
    vocabulary: &[String],
) -> Selection {
    let active: Vec<&Flow> = flows.iter().filter(|f| f.is_active).collect();
    let text_lower = input.text.to_lowercase();
    let mut selection = Selection::default();

    if input.is_first_message {
        if let Some(flow) = active
            .iter()
            .find(|f| f.trigger_type == TriggerType::FirstMessage)
        {
            debug!("flow '{}' matched first_message", flow.name);
            selection.flow = Some((*flow).clone());
            selection.matched_by = Some(TriggerType::FirstMessage);
            return selection;
        }
    }

    if let Some(flow) = active.iter().find(|f| matches_keyword(f, &text_lower)) {
        debug!("flow '{}' matched keyword", flow.name);
        selection.flow = Some((*flow).clone());
        selection.matched_by = Some(TriggerType::Keyword);
        return selection;
    }

    let wants_intent = active.iter().any(|f| !intent_labels(f).is_empty());
    if let (true, Some(classifier)) = (wants_intent, classifier) {
        match classifier
            .classify(input.text, input.history, vocabulary)
            .await
        {
            Ok(intent) => {
                let intent = intent.trim().to_lowercase();
                debug!("classified intent: {intent}");
                if let Some(flow) = active
                    .iter()
                    .find(|f| intent_labels(f).iter().any(|l| *l == intent))
                {
                    selection.flow = Some((*flow).clone());
                    selection.matched_by = Some(TriggerType::Intent);
                }
                selection.detected_intent = Some(intent);
                if selection.flow.is_some() {
                    return selection;
                }
            }
            Err(e) => warn!("intent classification failed, skipping intent step: {e}"),
        }
    }

    if let Some(flow) = active
        .iter()
        .find(|f| f.trigger_type == TriggerType::AllMessages)
    {
        selection.flow = Some((*flow).clone());
        selection.matched_by = Some(TriggerType::AllMessages);
    }
    selection
}
