//! # zaprelay-crm
//!
//! Client for the CRM's open-channel REST surface.

pub mod client;
pub mod connector;
pub mod token;

pub use client::{classify_response, CrmRpc, RpcOutcome};
pub use connector::{CrmClient, BOUND_EVENTS};
pub use token::{needs_refresh, TokenRefresher};

/// Integration platform discriminator for CRM rows.
pub const PLATFORM: &str = "crm";
