//! # zaprelay-store
//!
//! SQLite-backed datastore for zaprelay: integrations, instances, contacts,
//! conversations, messages, channel mappings, the CRM event queue, and flows.

pub mod failures;
pub mod store;

pub use failures::{FailureEntry, FailureLog};
pub use store::{NewFlow, QueueCounts, Store};
