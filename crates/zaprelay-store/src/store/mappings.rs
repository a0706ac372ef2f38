//! Channel mappings: which CRM line an instance feeds.

use super::{now, rows, Store};
use uuid::Uuid;
use zaprelay_core::{error::RelayError, model::ChannelMapping};

impl Store {
    /// Map an instance to a line.
    ///
    /// Rejected with `Conflict` when the instance already has an active line
    /// or the line already has an active instance in the tenant.
    pub async fn create_channel_mapping(
        &self,
        tenant_id: &str,
        instance_id: &str,
        line_id: i64,
    ) -> Result<ChannelMapping, RelayError> {
        if let Some(m) = self.active_mapping_for_instance(instance_id).await? {
            return Err(RelayError::Conflict(format!(
                "instance {instance_id} is already mapped to line {}",
                m.line_id
            )));
        }
        if let Some(m) = self.active_mapping_for_line(tenant_id, line_id).await? {
            return Err(RelayError::Conflict(format!(
                "line {line_id} is already mapped to instance {}",
                m.instance_id
            )));
        }

        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO channel_mappings (id, tenant_id, instance_id, line_id, is_active, created_at) \
             VALUES (?, ?, ?, ?, 1, ?)",
        )
        .bind(&id)
        .bind(tenant_id)
        .bind(instance_id)
        .bind(line_id)
        .bind(now())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            // A concurrent insert can still trip the partial unique indexes.
            if e.as_database_error()
                .is_some_and(|db| db.is_unique_violation())
            {
                RelayError::Conflict(format!("duplicate mapping for line {line_id}"))
            } else {
                RelayError::Store(format!("create mapping failed: {e}"))
            }
        })?;

        self.active_mapping_for_instance(instance_id)
            .await?
            .ok_or_else(|| RelayError::NotFound(format!("mapping {id}")))
    }

    pub async fn active_mapping_for_instance(
        &self,
        instance_id: &str,
    ) -> Result<Option<ChannelMapping>, RelayError> {
        let sql = format!(
            "SELECT {} FROM channel_mappings WHERE instance_id = ? AND is_active = 1",
            rows::MAPPING_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(instance_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| RelayError::Store(format!("query failed: {e}")))?;
        row.as_ref().map(rows::mapping).transpose()
    }

    pub async fn active_mapping_for_line(
        &self,
        tenant_id: &str,
        line_id: i64,
    ) -> Result<Option<ChannelMapping>, RelayError> {
        let sql = format!(
            "SELECT {} FROM channel_mappings WHERE tenant_id = ? AND line_id = ? AND is_active = 1",
            rows::MAPPING_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(tenant_id)
            .bind(line_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| RelayError::Store(format!("query failed: {e}")))?;
        row.as_ref().map(rows::mapping).transpose()
    }

    /// Deactivate the line's mapping. Returns whether one was active.
    pub async fn deactivate_line(&self, tenant_id: &str, line_id: i64) -> Result<bool, RelayError> {
        let result = sqlx::query(
            "UPDATE channel_mappings SET is_active = 0 \
             WHERE tenant_id = ? AND line_id = ? AND is_active = 1",
        )
        .bind(tenant_id)
        .bind(line_id)
        .execute(&self.pool)
        .await
        .map_err(|e| RelayError::Store(format!("update mapping failed: {e}")))?;
        Ok(result.rows_affected() > 0)
    }
}
