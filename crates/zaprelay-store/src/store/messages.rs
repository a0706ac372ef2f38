//! Message storage: idempotent ingestion and delivery status.

use super::{now, rows, Store};
use uuid::Uuid;
use zaprelay_core::{
    error::RelayError,
    model::{MessageMetadata, MessageRecord, MessageStatus, NewMessage},
};

impl Store {
    /// Insert a message. Returns `None` when the provider message id was
    /// already stored for the instance (re-delivery).
    pub async fn insert_message(&self, msg: &NewMessage) -> Result<Option<MessageRecord>, RelayError> {
        let id = Uuid::new_v4().to_string();
        let result = sqlx::query(
            "INSERT INTO messages \
             (id, conversation_id, instance_id, direction, kind, content, status, media_url, \
              transcription, is_bot, provider_message_id, metadata, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT DO NOTHING",
        )
        .bind(&id)
        .bind(&msg.conversation_id)
        .bind(&msg.instance_id)
        .bind(msg.direction.as_str())
        .bind(msg.kind.as_str())
        .bind(&msg.content)
        .bind(msg.status.as_str())
        .bind(&msg.media_url)
        .bind(&msg.transcription)
        .bind(msg.is_bot)
        .bind(&msg.provider_message_id)
        .bind(rows::to_json(&msg.metadata)?)
        .bind(now())
        .execute(&self.pool)
        .await
        .map_err(|e| RelayError::Store(format!("insert message failed: {e}")))?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_message(&id).await.map(Some)
    }

    pub async fn get_message(&self, id: &str) -> Result<MessageRecord, RelayError> {
        let sql = format!("SELECT {} FROM messages WHERE id = ?", rows::MESSAGE_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| RelayError::Store(format!("query failed: {e}")))?
            .ok_or_else(|| RelayError::NotFound(format!("message {id}")))?;
        rows::message(&row)
    }

    pub async fn find_message_by_provider_id(
        &self,
        instance_id: &str,
        provider_message_id: &str,
    ) -> Result<Option<MessageRecord>, RelayError> {
        let sql = format!(
            "SELECT {} FROM messages WHERE instance_id = ? AND provider_message_id = ?",
            rows::MESSAGE_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(instance_id)
            .bind(provider_message_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| RelayError::Store(format!("query failed: {e}")))?;
        row.as_ref().map(rows::message).transpose()
    }

    /// Advance a message's delivery status. Receipts never move a status
    /// backwards (a late `delivered` after `read` is ignored).
    ///
    /// Returns the updated record, or `None` if unknown or not advanced.
    pub async fn advance_message_status(
        &self,
        instance_id: &str,
        provider_message_id: &str,
        status: MessageStatus,
    ) -> Result<Option<MessageRecord>, RelayError> {
        let Some(current) = self
            .find_message_by_provider_id(instance_id, provider_message_id)
            .await?
        else {
            return Ok(None);
        };
        if status <= current.status {
            return Ok(None);
        }
        sqlx::query("UPDATE messages SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(&current.id)
            .execute(&self.pool)
            .await
            .map_err(|e| RelayError::Store(format!("update message failed: {e}")))?;
        self.get_message(&current.id).await.map(Some)
    }

    pub async fn set_message_metadata(
        &self,
        id: &str,
        metadata: &MessageMetadata,
    ) -> Result<(), RelayError> {
        sqlx::query("UPDATE messages SET metadata = ? WHERE id = ?")
            .bind(rows::to_json(metadata)?)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| RelayError::Store(format!("update message failed: {e}")))?;
        Ok(())
    }

    /// The last `limit` messages of a conversation, oldest first.
    pub async fn recent_messages(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<MessageRecord>, RelayError> {
        let sql = format!(
            "SELECT {} FROM (\
                 SELECT *, rowid AS rid FROM messages WHERE conversation_id = ? \
                 ORDER BY created_at DESC, rid DESC LIMIT ?\
             ) ORDER BY created_at ASC, rid ASC",
            rows::MESSAGE_COLUMNS
        );
        let found = sqlx::query(&sql)
            .bind(conversation_id)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| RelayError::Store(format!("query failed: {e}")))?;
        found.iter().map(rows::message).collect()
    }

    /// Incoming messages ever received from a contact, across conversations.
    pub async fn count_incoming_from_contact(&self, contact_id: &str) -> Result<i64, RelayError> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM messages m \
             JOIN conversations c ON c.id = m.conversation_id \
             WHERE c.contact_id = ? AND m.direction = 'incoming'",
        )
        .bind(contact_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| RelayError::Store(format!("query failed: {e}")))?;
        Ok(count)
    }
}
