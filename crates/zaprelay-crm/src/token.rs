//! OAuth access-token upkeep for CRM integrations.

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tracing::{info, warn};
use zaprelay_core::{
    config::CrmConfig,
    error::RelayError,
    model::{Integration, IntegrationConfig},
};
use zaprelay_store::Store;

/// Token endpoint response.
#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub client_endpoint: Option<String>,
    #[serde(default)]
    pub member_id: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
}

/// Whether the cached token is missing or expires within `buffer_secs`.
///
/// A token without a known expiry is trusted.
pub fn needs_refresh(config: &IntegrationConfig, now: DateTime<Utc>, buffer_secs: i64) -> bool {
    if config.access_token.is_empty() {
        return true;
    }
    match config.token_expires_at {
        Some(expires_at) => expires_at - now <= Duration::seconds(buffer_secs),
        None => false,
    }
}

/// Fold a token response into the integration config.
pub(crate) fn apply_token(config: &mut IntegrationConfig, token: TokenResponse, now: DateTime<Utc>) {
    config.access_token = token.access_token;
    if let Some(refresh) = token.refresh_token.filter(|t| !t.is_empty()) {
        config.refresh_token = refresh;
    }
    config.token_expires_at = Some(now + Duration::seconds(token.expires_in.unwrap_or(3600)));
    if let Some(endpoint) = token.client_endpoint.filter(|e| !e.is_empty()) {
        config.client_endpoint = endpoint;
    }
    if let Some(member) = token.member_id.filter(|m| !m.is_empty()) {
        config.member_id = member;
    }
    if let Some(domain) = token.domain.filter(|d| !d.is_empty()) {
        config.domain = domain;
    }
    config.token_failed = false;
    config.token_error = None;
}

/// Keeps integration access tokens fresh. Never retries.
pub struct TokenRefresher {
    client: reqwest::Client,
    store: Store,
    config: CrmConfig,
}

impl TokenRefresher {
    pub fn new(store: Store, config: CrmConfig) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(config.request_timeout_secs))
                .build()
                .unwrap_or_default(),
            store,
            config,
        }
    }

    /// A token usable right now, refreshing it when close to expiry.
    ///
    /// Refresh failures degrade to the previous token; `None` only when the
    /// integration holds no token at all.
    pub async fn valid_token(&self, integration: &Integration) -> Option<String> {
        let cached = &integration.config.access_token;
        if !needs_refresh(&integration.config, Utc::now(), self.config.refresh_buffer()) {
            return Some(cached.clone());
        }

        match self.refresh(integration).await {
            Ok(token) => Some(token),
            Err(e) => {
                warn!("crm: token refresh for {} failed: {e}", integration.id);
                (!cached.is_empty()).then(|| cached.clone())
            }
        }
    }

    /// Exchange the refresh token and persist the result.
    async fn refresh(&self, integration: &Integration) -> Result<String, RelayError> {
        if integration.config.refresh_token.is_empty() {
            return Err(RelayError::CrmAuth("no refresh token stored".into()));
        }
        if self.config.client_id.is_empty() || self.config.client_secret.is_empty() {
            return Err(RelayError::Config("crm client credentials not configured".into()));
        }

        let url = format!(
            "{}?grant_type=refresh_token&client_id={}&client_secret={}&refresh_token={}",
            self.config.token_url,
            urlencoding::encode(&self.config.client_id),
            urlencoding::encode(&self.config.client_secret),
            urlencoding::encode(&integration.config.refresh_token),
        );
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| RelayError::Crm(format!("token request failed: {e}")))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(RelayError::CrmAuth(format!(
                "token endpoint returned {status}: {body}"
            )));
        }
        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|e| RelayError::Crm(format!("token response parse failed: {e}")))?;

        // Re-read so flags written since the caller loaded the row survive.
        let mut config = self.store.get_integration(&integration.id).await?.config;
        apply_token(&mut config, token, Utc::now());
        self.store
            .update_integration_config(&integration.id, &config)
            .await?;
        info!("crm: refreshed token for integration {}", integration.id);
        Ok(config.access_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_expiring_in(secs: i64) -> IntegrationConfig {
        IntegrationConfig {
            access_token: "tok".into(),
            refresh_token: "ref".into(),
            token_expires_at: Some(Utc::now() + Duration::seconds(secs)),
            ..Default::default()
        }
    }

    #[test]
    fn test_needs_refresh_window() {
        let now = Utc::now();
        assert!(!needs_refresh(&config_expiring_in(3600), now, 600));
        assert!(needs_refresh(&config_expiring_in(300), now, 600));
        assert!(needs_refresh(&config_expiring_in(-10), now, 600));
        assert!(needs_refresh(&IntegrationConfig::default(), now, 600));

        let no_expiry = IntegrationConfig {
            access_token: "tok".into(),
            ..Default::default()
        };
        assert!(!needs_refresh(&no_expiry, now, 600));
    }

    #[test]
    fn test_apply_token_clears_failure_and_keeps_refresh() {
        let mut config = IntegrationConfig {
            access_token: "old".into(),
            refresh_token: "ref-old".into(),
            token_failed: true,
            token_error: Some("expired_token".into()),
            ..Default::default()
        };
        let now = Utc::now();
        apply_token(
            &mut config,
            TokenResponse {
                access_token: "new".into(),
                refresh_token: None,
                expires_in: Some(3600),
                client_endpoint: Some("https://acme.example/rest/".into()),
                member_id: None,
                domain: None,
            },
            now,
        );
        assert_eq!(config.access_token, "new");
        assert_eq!(config.refresh_token, "ref-old");
        assert_eq!(config.token_expires_at, Some(now + Duration::seconds(3600)));
        assert_eq!(config.client_endpoint, "https://acme.example/rest/");
        assert!(!config.token_failed);
        assert!(config.token_error.is_none());
    }

    #[tokio::test]
    async fn test_fresh_token_returned_without_refresh() {
        let store = Store::in_memory().await.unwrap();
        let integration = store
            .create_integration("t1", "crm", &config_expiring_in(3600))
            .await
            .unwrap();
        let refresher = TokenRefresher::new(store, CrmConfig::default());
        assert_eq!(refresher.valid_token(&integration).await.as_deref(), Some("tok"));
    }

    #[tokio::test]
    async fn test_failed_refresh_returns_previous_token() {
        let store = Store::in_memory().await.unwrap();
        let integration = store
            .create_integration("t1", "crm", &config_expiring_in(60))
            .await
            .unwrap();
        let crm = CrmConfig {
            client_id: "app".into(),
            client_secret: "secret".into(),
            token_url: "http://127.0.0.1:9/oauth/token/".into(),
            request_timeout_secs: 2,
            ..Default::default()
        };
        let refresher = TokenRefresher::new(store.clone(), crm);
        assert_eq!(refresher.valid_token(&integration).await.as_deref(), Some("tok"));

        let stored = store.get_integration(&integration.id).await.unwrap();
        assert_eq!(stored.config.access_token, "tok");
    }

    #[tokio::test]
    async fn test_no_token_at_all_is_none() {
        let store = Store::in_memory().await.unwrap();
        let integration = store
            .create_integration("t1", "crm", &IntegrationConfig::default())
            .await
            .unwrap();
        let refresher = TokenRefresher::new(store, CrmConfig::default());
        assert!(refresher.valid_token(&integration).await.is_none());
    }
}
