use thiserror::Error;

/// Top-level error type for zaprelay.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Error from an AI, classification, or transcription provider.
    #[error("provider error: {0}")]
    Provider(String),

    /// Error from a messaging provider (gateway or aggregator).
    #[error("channel error: {0}")]
    Channel(String),

    /// Error from the CRM remote API.
    #[error("crm error: {0}")]
    Crm(String),

    /// Authorization against the CRM failed and could not be recovered by refresh.
    #[error("crm authorization failed: {0}")]
    CrmAuth(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Datastore error.
    #[error("store error: {0}")]
    Store(String),

    /// Flow graph or flow execution error.
    #[error("flow error: {0}")]
    Flow(String),

    /// A referenced row does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A uniqueness rule was violated (e.g. duplicate channel mapping).
    #[error("conflict: {0}")]
    Conflict(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
