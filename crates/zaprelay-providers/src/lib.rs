//! # zaprelay-providers
//!
//! AI provider implementations for zaprelay: the generic responder used as
//! the automation fallback, and the intent classifier used for flow selection.

pub mod classifier;
pub mod openai;

pub use classifier::{OpenAiClassifier, FALLBACK_INTENT};
pub use openai::OpenAiResponder;
