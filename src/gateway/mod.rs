//! Relay core: the pipelines connecting messaging providers, the datastore,
//! the flow engine and the CRM.
//!
//! Includes: inbound normalization, the attendance gate and automation, the
//! outbound dispatcher, the CRM event queue worker, and best-effort side
//! effects with their own failure log.

mod automation;
mod dispatcher;
mod inbound;
mod operator;
mod poller;
mod relay;
mod side_effects;
mod worker;


pub use dispatcher::SendRequest;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;
use zaprelay_channels::{provider_for, LocalMediaStorage, WhisperTranscriber};
use zaprelay_core::{
    config::{Config, FlowConfig, QueueConfig},
    error::RelayError,
    model::ProviderKind,
    shellexpand,
    traits::{AiResponder, CrmApi, IntentClassifier, MediaStorage, MessagingProvider, Transcriber},
};
use zaprelay_crm::CrmClient;
use zaprelay_flows::FlowEngine;
use zaprelay_providers::{OpenAiClassifier, OpenAiResponder};
use zaprelay_store::{FailureLog, Store};

/// Collaborators a [`Relay`] is assembled from.
pub struct RelayParts {
    pub store: Store,
    pub providers: Vec<Arc<dyn MessagingProvider>>,
    pub responder: Option<Arc<dyn AiResponder>>,
    pub classifier: Option<Arc<dyn IntentClassifier>>,
    pub transcriber: Option<Arc<dyn Transcriber>>,
    pub media: Arc<dyn MediaStorage>,
    pub crm: Arc<dyn CrmApi>,
    pub flows: FlowConfig,
    pub queue: QueueConfig,
    pub system_prompt: String,
}

/// The relay. Every entry point is a short-lived invocation; all coordination
/// goes through the store.
pub struct Relay {
    pub(super) store: Store,
    pub(super) failures: FailureLog,
    pub(super) providers: Vec<Arc<dyn MessagingProvider>>,
    pub(super) responder: Option<Arc<dyn AiResponder>>,
    pub(super) classifier: Option<Arc<dyn IntentClassifier>>,
    pub(super) transcriber: Option<Arc<dyn Transcriber>>,
    pub(super) media: Arc<dyn MediaStorage>,
    pub(super) crm: Arc<dyn CrmApi>,
    pub(super) engine: FlowEngine,
    pub(super) flow_config: FlowConfig,
    pub(super) queue_config: QueueConfig,
    pub(super) system_prompt: String,
    pub(super) uptime: Instant,
}

impl Relay {
    pub fn new(parts: RelayParts) -> Self {
        let failures = FailureLog::new(parts.store.pool().clone());
        Self {
            failures,
            engine: FlowEngine::new(&parts.flows),
            store: parts.store,
            providers: parts.providers,
            responder: parts.responder,
            classifier: parts.classifier,
            transcriber: parts.transcriber,
            media: parts.media,
            crm: parts.crm,
            flow_config: parts.flows,
            queue_config: parts.queue,
            system_prompt: parts.system_prompt,
            uptime: Instant::now(),
        }
    }

    /// Build the production relay from configuration.
    pub fn from_config(config: &Config, store: Store) -> Self {
        let ai_enabled = config.ai.enabled && !config.ai.api_key.is_empty();
        let responder: Option<Arc<dyn AiResponder>> =
            ai_enabled.then(|| Arc::new(OpenAiResponder::new(&config.ai)) as Arc<dyn AiResponder>);
        let classifier: Option<Arc<dyn IntentClassifier>> = ai_enabled
            .then(|| Arc::new(OpenAiClassifier::new(&config.ai)) as Arc<dyn IntentClassifier>);
        let transcriber: Option<Arc<dyn Transcriber>> = config.transcription.enabled.then(|| {
            Arc::new(WhisperTranscriber::new(&config.transcription, &config.ai.api_key))
                as Arc<dyn Transcriber>
        });

        info!(
            "relay: ai responder {}, transcription {}",
            if responder.is_some() { "on" } else { "off" },
            if transcriber.is_some() { "on" } else { "off" },
        );

        Self::new(RelayParts {
            crm: Arc::new(CrmClient::new(
                store.clone(),
                config.crm.clone(),
                &config.api.public_url,
            )),
            store,
            providers: vec![
                provider_for(ProviderKind::Gateway),
                provider_for(ProviderKind::Aggregator),
            ],
            responder,
            classifier,
            transcriber,
            media: Arc::new(LocalMediaStorage::new(
                media_dir(&config.relay.data_dir),
                &config.api.public_url,
            )),
            flows: config.flows.clone(),
            queue: config.queue.clone(),
            system_prompt: config.ai.system_prompt.clone(),
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn failures(&self) -> &FailureLog {
        &self.failures
    }

    pub fn queue_config(&self) -> &QueueConfig {
        &self.queue_config
    }

    pub fn uptime(&self) -> Instant {
        self.uptime
    }

    pub(super) fn provider(&self, kind: ProviderKind) -> Result<&Arc<dyn MessagingProvider>, RelayError> {
        self.providers
            .iter()
            .find(|p| p.kind() == kind)
            .ok_or_else(|| RelayError::Config(format!("no {} provider configured", kind.as_str())))
    }
}

/// Directory stored media is written to and served from.
pub fn media_dir(data_dir: &str) -> PathBuf {
    PathBuf::from(shellexpand(data_dir)).join("media")
}

/// Spawn the optional queue poller.
pub fn spawn_poller(relay: Arc<Relay>) -> Option<tokio::task::JoinHandle<()>> {
    let interval = relay.queue_config.poll_interval_secs;
    (interval > 0).then(|| tokio::spawn(poller::poll_loop(relay, interval)))
}
