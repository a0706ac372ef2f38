//! Low-level CRM REST calls: `POST {client_endpoint}{method}?auth={token}`.

use serde_json::Value;
use tracing::{debug, warn};
use zaprelay_core::{error::RelayError, model::Integration};
use zaprelay_store::Store;

use crate::token::TokenRefresher;

/// Error codes the CRM uses for rejected credentials.
const AUTH_ERRORS: &[&str] = &[
    "expired_token",
    "invalid_token",
    "no_auth_found",
    "wrong_auth_type",
    "invalid_grant",
    "authorization_error",
];

/// How a CRM response should be treated.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcOutcome {
    Ok(Value),
    /// The object already exists; the call is idempotent and counts as done.
    AlreadyExists,
    AuthFailed(String),
    Failed(String),
}

fn is_already_exists(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    lower.contains("already exists")
        || lower.contains("already_exists")
        || lower.contains("handler already binded")
        || lower.contains("already binded")
}

/// Classify a response from its HTTP status and JSON body. Pure.
pub fn classify_response(status: u16, body: &Value) -> RpcOutcome {
    let code = body["error"].as_str().unwrap_or("");
    let description = body["error_description"].as_str().unwrap_or("");

    if code.is_empty() && (200..300).contains(&status) {
        return RpcOutcome::Ok(body.get("result").cloned().unwrap_or(Value::Null));
    }

    let message = match (code, description) {
        ("", "") => format!("HTTP {status}"),
        (code, "") => code.to_string(),
        ("", desc) => desc.to_string(),
        (code, desc) => format!("{code}: {desc}"),
    };
    if is_already_exists(&message) {
        return RpcOutcome::AlreadyExists;
    }
    if status == 401 || AUTH_ERRORS.contains(&code.to_ascii_lowercase().as_str()) {
        return RpcOutcome::AuthFailed(message);
    }
    RpcOutcome::Failed(message)
}

/// Authenticated RPC access to a tenant's CRM.
pub struct CrmRpc {
    client: reqwest::Client,
    store: Store,
    tokens: TokenRefresher,
}

impl CrmRpc {
    pub fn new(client: reqwest::Client, store: Store, tokens: TokenRefresher) -> Self {
        Self {
            client,
            store,
            tokens,
        }
    }

    /// Call a method. "Already exists" answers come back as `Value::Null`.
    ///
    /// Authorization failures set the integration's sticky `token_failed` flag.
    pub async fn call(
        &self,
        integration: &Integration,
        method: &str,
        params: &Value,
    ) -> Result<Value, RelayError> {
        let endpoint = integration.config.client_endpoint.trim();
        if endpoint.is_empty() {
            return Err(RelayError::Crm(format!(
                "integration {} has no client endpoint",
                integration.id
            )));
        }
        let token = self.tokens.valid_token(integration).await.ok_or_else(|| {
            RelayError::CrmAuth(format!("integration {} has no access token", integration.id))
        })?;

        let base = if endpoint.ends_with('/') {
            endpoint.to_string()
        } else {
            format!("{endpoint}/")
        };
        let url = format!("{base}{method}?auth={}", urlencoding::encode(&token));
        debug!("crm: POST {base}{method}");

        let resp = self
            .client
            .post(&url)
            .json(params)
            .send()
            .await
            .map_err(|e| RelayError::Crm(format!("{method} request failed: {e}")))?;
        let status = resp.status().as_u16();
        let body: Value = resp.json().await.unwrap_or(Value::Null);

        match classify_response(status, &body) {
            RpcOutcome::Ok(result) => Ok(result),
            RpcOutcome::AlreadyExists => {
                debug!("crm: {method}: already exists, treating as success");
                Ok(Value::Null)
            }
            RpcOutcome::AuthFailed(message) => {
                self.mark_token_failed(&integration.id, &message).await;
                Err(RelayError::CrmAuth(format!("{method}: {message}")))
            }
            RpcOutcome::Failed(message) => Err(RelayError::Crm(format!("{method}: {message}"))),
        }
    }

    /// Record a rejected token on the integration. Best-effort.
    pub async fn mark_token_failed(&self, integration_id: &str, error: &str) {
        match self.flag_token_failure(integration_id, error).await {
            Ok(()) => warn!("crm: token for integration {integration_id} rejected: {error}"),
            Err(e) => warn!("crm: could not flag token failure on {integration_id}: {e}"),
        }
    }

    async fn flag_token_failure(&self, integration_id: &str, error: &str) -> Result<(), RelayError> {
        let mut config = self.store.get_integration(integration_id).await?.config;
        config.token_failed = true;
        config.token_error = Some(error.to_string());
        self.store
            .update_integration_config(integration_id, &config)
            .await
    }

    pub fn store(&self) -> &Store {
        &self.store
    }
}
