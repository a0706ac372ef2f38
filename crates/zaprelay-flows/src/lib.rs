//! # zaprelay-flows
//!
//! Automation flows: choosing a flow for an inbound message and interpreting
//! its node graph against a [`FlowHost`].

mod engine;
mod node;
mod select;

#[cfg(test)]
mod tests;

pub use engine::{ExecutionOutcome, FlowEnd, FlowEngine, FlowHost};
pub use node::{evaluate_condition, NodeKind};
pub use select::{intent_labels, keywords, select_flow, Selection, SelectionInput};
