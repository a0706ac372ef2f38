//! Conversation lifecycle: open-conversation lookup, attendance, bot state.

use super::{now, rows, Store};
use uuid::Uuid;
use zaprelay_core::{
    attendance::Attendance,
    error::RelayError,
    model::{BotState, Conversation, ConversationStatus},
};

const OPEN_STATUSES: &str = "('open', 'in_progress', 'waiting_human')";

impl Store {
    pub async fn get_conversation(&self, id: &str) -> Result<Conversation, RelayError> {
        let sql = format!(
            "SELECT {} FROM conversations WHERE id = ?",
            rows::CONVERSATION_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| RelayError::Store(format!("query failed: {e}")))?
            .ok_or_else(|| RelayError::NotFound(format!("conversation {id}")))?;
        rows::conversation(&row)
    }

    /// The most recently active open conversation between instance and contact.
    pub async fn find_open_conversation(
        &self,
        instance_id: &str,
        contact_id: &str,
    ) -> Result<Option<Conversation>, RelayError> {
        let sql = format!(
            "SELECT {} FROM conversations \
             WHERE instance_id = ? AND contact_id = ? AND status IN {OPEN_STATUSES} \
             ORDER BY last_activity_at DESC LIMIT 1",
            rows::CONVERSATION_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(instance_id)
            .bind(contact_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| RelayError::Store(format!("query failed: {e}")))?;
        row.as_ref().map(rows::conversation).transpose()
    }

    /// Return the open conversation, creating one if none is open.
    ///
    /// The partial unique index makes a concurrent create collapse onto the
    /// row that won.
    pub async fn open_conversation(
        &self,
        tenant_id: &str,
        instance_id: &str,
        contact_id: &str,
    ) -> Result<Conversation, RelayError> {
        if let Some(conv) = self.find_open_conversation(instance_id, contact_id).await? {
            return Ok(conv);
        }

        let ts = now();
        let bot_state = rows::to_json(&BotState::default())?;
        sqlx::query(
            "INSERT OR IGNORE INTO conversations \
             (id, tenant_id, instance_id, contact_id, status, attendance_mode, bot_state, \
              last_activity_at, created_at, updated_at) \
             VALUES (?, ?, ?, ?, 'open', 'ai', ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(tenant_id)
        .bind(instance_id)
        .bind(contact_id)
        .bind(bot_state)
        .bind(&ts)
        .bind(&ts)
        .bind(&ts)
        .execute(&self.pool)
        .await
        .map_err(|e| RelayError::Store(format!("create conversation failed: {e}")))?;

        self.find_open_conversation(instance_id, contact_id)
            .await?
            .ok_or_else(|| RelayError::NotFound(format!("open conversation for {contact_id}")))
    }

    /// Persist an attendance transition, optionally with a new status.
    pub async fn set_attendance(
        &self,
        id: &str,
        attendance: &Attendance,
        status: Option<ConversationStatus>,
    ) -> Result<(), RelayError> {
        let result = sqlx::query(
            "UPDATE conversations SET attendance_mode = ?, assigned_to = ?, \
                 status = COALESCE(?, status), updated_at = ? \
             WHERE id = ?",
        )
        .bind(attendance.mode_str())
        .bind(attendance.assigned_to())
        .bind(status.map(|s| s.as_str()))
        .bind(now())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| RelayError::Store(format!("update conversation failed: {e}")))?;
        if result.rows_affected() == 0 {
            return Err(RelayError::NotFound(format!("conversation {id}")));
        }
        Ok(())
    }

    pub async fn set_department(&self, id: &str, department: &str) -> Result<(), RelayError> {
        sqlx::query("UPDATE conversations SET department = ?, updated_at = ? WHERE id = ?")
            .bind(department)
            .bind(now())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| RelayError::Store(format!("update conversation failed: {e}")))?;
        Ok(())
    }

    pub async fn save_bot_state(&self, id: &str, state: &BotState) -> Result<(), RelayError> {
        sqlx::query("UPDATE conversations SET bot_state = ?, updated_at = ? WHERE id = ?")
            .bind(rows::to_json(state)?)
            .bind(now())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| RelayError::Store(format!("update conversation failed: {e}")))?;
        Ok(())
    }

    /// Bump `last_activity_at`, and the unread counter for unhandled inbound.
    pub async fn touch_conversation(&self, id: &str, unread: bool) -> Result<(), RelayError> {
        let ts = now();
        sqlx::query(
            "UPDATE conversations SET last_activity_at = ?, updated_at = ?, \
                 unread_count = unread_count + ? \
             WHERE id = ?",
        )
        .bind(&ts)
        .bind(&ts)
        .bind(i64::from(unread))
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| RelayError::Store(format!("update conversation failed: {e}")))?;
        Ok(())
    }

    pub async fn mark_conversation_read(&self, id: &str) -> Result<(), RelayError> {
        let result =
            sqlx::query("UPDATE conversations SET unread_count = 0, updated_at = ? WHERE id = ?")
                .bind(now())
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(|e| RelayError::Store(format!("update conversation failed: {e}")))?;
        if result.rows_affected() == 0 {
            return Err(RelayError::NotFound(format!("conversation {id}")));
        }
        Ok(())
    }

    /// Open conversations count (for `status`).
    pub async fn count_open_conversations(&self) -> Result<i64, RelayError> {
        let sql = format!("SELECT COUNT(*) FROM conversations WHERE status IN {OPEN_STATUSES}");
        let (count,): (i64,) = sqlx::query_as(&sql)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| RelayError::Store(format!("query failed: {e}")))?;
        Ok(count)
    }
}
