//! CRM integrations: credentials and feature flags per tenant.

use super::{now, rows, Store};
use uuid::Uuid;
use zaprelay_core::{
    error::RelayError,
    model::{Integration, IntegrationConfig},
};

impl Store {
    /// Create an active integration.
    pub async fn create_integration(
        &self,
        tenant_id: &str,
        platform: &str,
        config: &IntegrationConfig,
    ) -> Result<Integration, RelayError> {
        let id = Uuid::new_v4().to_string();
        let ts = now();
        sqlx::query(
            "INSERT INTO integrations (id, tenant_id, platform, is_active, config, created_at, updated_at) \
             VALUES (?, ?, ?, 1, ?, ?, ?)",
        )
        .bind(&id)
        .bind(tenant_id)
        .bind(platform)
        .bind(rows::to_json(config)?)
        .bind(&ts)
        .bind(&ts)
        .execute(&self.pool)
        .await
        .map_err(|e| RelayError::Store(format!("create integration failed: {e}")))?;

        self.get_integration(&id).await
    }

    pub async fn get_integration(&self, id: &str) -> Result<Integration, RelayError> {
        let sql = format!(
            "SELECT {} FROM integrations WHERE id = ?",
            rows::INTEGRATION_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| RelayError::Store(format!("query failed: {e}")))?
            .ok_or_else(|| RelayError::NotFound(format!("integration {id}")))?;
        rows::integration(&row)
    }

    /// The tenant's active integration for a platform, newest first.
    pub async fn active_integration(
        &self,
        tenant_id: &str,
        platform: &str,
    ) -> Result<Option<Integration>, RelayError> {
        let sql = format!(
            "SELECT {} FROM integrations \
             WHERE tenant_id = ? AND platform = ? AND is_active = 1 \
             ORDER BY created_at DESC LIMIT 1",
            rows::INTEGRATION_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(tenant_id)
            .bind(platform)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| RelayError::Store(format!("query failed: {e}")))?;
        row.as_ref().map(rows::integration).transpose()
    }

    /// Replace the integration's config document.
    pub async fn update_integration_config(
        &self,
        id: &str,
        config: &IntegrationConfig,
    ) -> Result<(), RelayError> {
        let result = sqlx::query("UPDATE integrations SET config = ?, updated_at = ? WHERE id = ?")
            .bind(rows::to_json(config)?)
            .bind(now())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| RelayError::Store(format!("update integration failed: {e}")))?;
        if result.rows_affected() == 0 {
            return Err(RelayError::NotFound(format!("integration {id}")));
        }
        Ok(())
    }

    /// Count active integrations (for `status`).
    pub async fn count_active_integrations(&self) -> Result<i64, RelayError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM integrations WHERE is_active = 1")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| RelayError::Store(format!("query failed: {e}")))?;
        Ok(count)
    }
}
