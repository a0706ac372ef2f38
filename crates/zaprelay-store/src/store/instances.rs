//! Messaging-provider instances and their connection lifecycle.

use super::{now, rows, Store};
use uuid::Uuid;
use zaprelay_core::{
    error::RelayError,
    model::{Instance, InstanceConfig, InstanceStatus, ProviderKind},
};

impl Store {
    pub async fn create_instance(
        &self,
        tenant_id: &str,
        name: &str,
        provider: ProviderKind,
        config: &InstanceConfig,
    ) -> Result<Instance, RelayError> {
        let id = Uuid::new_v4().to_string();
        let ts = now();
        sqlx::query(
            "INSERT INTO instances (id, tenant_id, name, provider, status, config, created_at, updated_at) \
             VALUES (?, ?, ?, ?, 'qr_pending', ?, ?, ?)",
        )
        .bind(&id)
        .bind(tenant_id)
        .bind(name)
        .bind(provider.as_str())
        .bind(rows::to_json(config)?)
        .bind(&ts)
        .bind(&ts)
        .execute(&self.pool)
        .await
        .map_err(|e| RelayError::Store(format!("create instance failed: {e}")))?;

        self.get_instance(&id).await
    }

    pub async fn get_instance(&self, id: &str) -> Result<Instance, RelayError> {
        let sql = format!("SELECT {} FROM instances WHERE id = ?", rows::INSTANCE_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| RelayError::Store(format!("query failed: {e}")))?
            .ok_or_else(|| RelayError::NotFound(format!("instance {id}")))?;
        rows::instance(&row)
    }

    pub async fn list_instances(&self, tenant_id: &str) -> Result<Vec<Instance>, RelayError> {
        let sql = format!(
            "SELECT {} FROM instances WHERE tenant_id = ? ORDER BY created_at ASC",
            rows::INSTANCE_COLUMNS
        );
        let found = sqlx::query(&sql)
            .bind(tenant_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| RelayError::Store(format!("query failed: {e}")))?;
        found.iter().map(rows::instance).collect()
    }

    /// The tenant's instance when it has exactly one; used when a CRM event
    /// names a line with no mapping.
    pub async fn sole_instance(&self, tenant_id: &str) -> Result<Option<Instance>, RelayError> {
        let mut all = self.list_instances(tenant_id).await?;
        if all.len() == 1 {
            Ok(all.pop())
        } else {
            Ok(None)
        }
    }

    /// Apply a lifecycle transition.
    ///
    /// `qr_pending` stores the QR code; `connected` clears it and records the
    /// phone number when known.
    pub async fn set_instance_status(
        &self,
        id: &str,
        status: InstanceStatus,
        qr_code: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<(), RelayError> {
        let result = sqlx::query(
            "UPDATE instances SET status = ?, \
                 qr_code = CASE WHEN ? = 'qr_pending' THEN ? ELSE NULL END, \
                 phone_number = COALESCE(?, phone_number), \
                 updated_at = ? \
             WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(status.as_str())
        .bind(qr_code)
        .bind(phone_number)
        .bind(now())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| RelayError::Store(format!("update instance failed: {e}")))?;
        if result.rows_affected() == 0 {
            return Err(RelayError::NotFound(format!("instance {id}")));
        }
        Ok(())
    }

    /// Instance counts grouped by status (for `status`).
    pub async fn count_instances_by_status(&self) -> Result<Vec<(String, i64)>, RelayError> {
        sqlx::query_as("SELECT status, COUNT(*) FROM instances GROUP BY status ORDER BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| RelayError::Store(format!("query failed: {e}")))
    }
}
