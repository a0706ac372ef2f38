//! Durable CRM event inbox with atomic claims and bounded retry.

use super::{now, rows, Store};
use chrono::{Duration, Utc};
use serde_json::Value;
use uuid::Uuid;
use zaprelay_core::{
    error::RelayError,
    model::{format_ts, QueueEntry, QueueStatus},
};

/// Entry counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub pending: i64,
    pub processing: i64,
    pub done: i64,
    pub failed: i64,
}

fn lease_cutoff(lease_secs: u64) -> String {
    format_ts(Utc::now() - Duration::seconds(lease_secs as i64))
}

impl Store {
    /// Append an event. Fast and fire-and-forget for the webhook path.
    pub async fn enqueue_event(
        &self,
        tenant_id: &str,
        event_type: &str,
        payload: &Value,
        max_attempts: u32,
    ) -> Result<String, RelayError> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO event_queue (id, tenant_id, event_type, payload, status, attempts, max_attempts, created_at) \
             VALUES (?, ?, ?, ?, 'pending', 0, ?, ?)",
        )
        .bind(&id)
        .bind(tenant_id)
        .bind(event_type)
        .bind(rows::to_json(payload)?)
        .bind(i64::from(max_attempts.max(1)))
        .bind(now())
        .execute(&self.pool)
        .await
        .map_err(|e| RelayError::Store(format!("enqueue failed: {e}")))?;
        Ok(id)
    }

    pub async fn get_event(&self, id: &str) -> Result<QueueEntry, RelayError> {
        let sql = format!("SELECT {} FROM event_queue WHERE id = ?", rows::QUEUE_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| RelayError::Store(format!("query failed: {e}")))?
            .ok_or_else(|| RelayError::NotFound(format!("event {id}")))?;
        rows::queue_entry(&row)
    }

    /// Ids of claimable entries, oldest first: pending ones, plus processing
    /// ones whose claim lease has expired.
    pub async fn claimable_events(
        &self,
        limit: usize,
        lease_secs: u64,
    ) -> Result<Vec<String>, RelayError> {
        let found: Vec<(String,)> = sqlx::query_as(
            "SELECT id FROM event_queue \
             WHERE (status = 'pending' OR (status = 'processing' AND claimed_at <= ?)) \
               AND attempts < max_attempts \
             ORDER BY created_at ASC, rowid ASC \
             LIMIT ?",
        )
        .bind(lease_cutoff(lease_secs))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RelayError::Store(format!("query failed: {e}")))?;
        Ok(found.into_iter().map(|(id,)| id).collect())
    }

    /// Atomically claim an entry: mark it `processing` and count the attempt.
    ///
    /// Succeeds only if the row is still claimable, so two workers racing on
    /// the same entry cannot both win.
    pub async fn claim_event(&self, id: &str, lease_secs: u64) -> Result<bool, RelayError> {
        let result = sqlx::query(
            "UPDATE event_queue SET status = 'processing', attempts = attempts + 1, claimed_at = ? \
             WHERE id = ? \
               AND attempts < max_attempts \
               AND (status = 'pending' OR (status = 'processing' AND claimed_at <= ?))",
        )
        .bind(now())
        .bind(id)
        .bind(lease_cutoff(lease_secs))
        .execute(&self.pool)
        .await
        .map_err(|e| RelayError::Store(format!("claim failed: {e}")))?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn complete_event(&self, id: &str) -> Result<(), RelayError> {
        sqlx::query(
            "UPDATE event_queue SET status = 'done', processed_at = ?, claimed_at = NULL \
             WHERE id = ?",
        )
        .bind(now())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| RelayError::Store(format!("complete event failed: {e}")))?;
        Ok(())
    }

    /// Record a handler failure. The entry goes back to `pending`, or to the
    /// terminal `failed` once its attempts reach `max_attempts`.
    pub async fn fail_event(&self, id: &str, error: &str) -> Result<QueueStatus, RelayError> {
        let ts = now();
        let row: Option<(String,)> = sqlx::query_as(
            "UPDATE event_queue SET \
                 status = CASE WHEN attempts >= max_attempts THEN 'failed' ELSE 'pending' END, \
                 last_error = ?, \
                 claimed_at = NULL, \
                 processed_at = CASE WHEN attempts >= max_attempts THEN ? ELSE processed_at END \
             WHERE id = ? \
             RETURNING status",
        )
        .bind(error)
        .bind(&ts)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| RelayError::Store(format!("fail event failed: {e}")))?;

        let (status,) = row.ok_or_else(|| RelayError::NotFound(format!("event {id}")))?;
        QueueStatus::parse(&status)
            .ok_or_else(|| RelayError::Store(format!("unknown queue status {status}")))
    }

    /// Fail abandoned claims that have no attempts left. Returns how many.
    pub async fn expire_exhausted_claims(&self, lease_secs: u64) -> Result<u64, RelayError> {
        let result = sqlx::query(
            "UPDATE event_queue SET status = 'failed', processed_at = ?, \
                 last_error = COALESCE(last_error, 'claim lease expired') \
             WHERE status = 'processing' AND claimed_at <= ? AND attempts >= max_attempts",
        )
        .bind(now())
        .bind(lease_cutoff(lease_secs))
        .execute(&self.pool)
        .await
        .map_err(|e| RelayError::Store(format!("expire claims failed: {e}")))?;
        Ok(result.rows_affected())
    }

    pub async fn queue_counts(&self) -> Result<QueueCounts, RelayError> {
        let found: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM event_queue GROUP BY status")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| RelayError::Store(format!("query failed: {e}")))?;
        let mut counts = QueueCounts::default();
        for (status, n) in found {
            match QueueStatus::parse(&status) {
                Some(QueueStatus::Pending) => counts.pending = n,
                Some(QueueStatus::Processing) => counts.processing = n,
                Some(QueueStatus::Done) => counts.done = n,
                Some(QueueStatus::Failed) => counts.failed = n,
                None => {}
            }
        }
        Ok(counts)
    }
}
