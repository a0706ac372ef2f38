//! # zaprelay-core
//!
//! Core types, traits, configuration, and error handling shared by every
//! zaprelay crate: the domain model, the attendance-mode gate, and the seams
//! (AI responder, messaging provider, CRM) the pipeline is built around.

pub mod attendance;
pub mod config;
pub mod context;
pub mod error;
pub mod flow;
pub mod message;
pub mod model;
pub mod phone;
pub mod traits;

pub use config::shellexpand;
