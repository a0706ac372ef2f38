//! # zaprelay-channels
//!
//! WhatsApp provider integrations, media decryption and storage, and voice
//! transcription.

pub mod aggregator;
pub mod gateway;
pub mod media;
pub mod qr;
pub mod storage;
pub mod whisper;

use std::sync::Arc;
use zaprelay_core::{model::ProviderKind, traits::MessagingProvider};

pub use aggregator::AggregatorProvider;
pub use gateway::GatewayProvider;
pub use storage::LocalMediaStorage;
pub use whisper::WhisperTranscriber;

/// Build the provider implementation for a kind.
pub fn provider_for(kind: ProviderKind) -> Arc<dyn MessagingProvider> {
    match kind {
        ProviderKind::Gateway => Arc::new(GatewayProvider::new()),
        ProviderKind::Aggregator => Arc::new(AggregatorProvider::new()),
    }
}
