//! Failure log for best-effort side effects.
//!
//! CRM receipts, inbound forwards, and media handling never fail the request
//! that triggered them; their errors land here instead.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::debug;
use uuid::Uuid;
use zaprelay_core::{
    error::RelayError,
    model::{format_ts, parse_ts},
};

/// A recorded side-effect failure.
#[derive(Debug, Clone)]
pub struct FailureEntry {
    /// What was attempted, e.g. `crm_receipt`.
    pub kind: String,
    /// The row it concerned (message id, conversation id, ...).
    pub reference: String,
    pub error: String,
    pub created_at: DateTime<Utc>,
}

/// Failure log backed by SQLite.
#[derive(Clone)]
pub struct FailureLog {
    pool: SqlitePool,
}

impl FailureLog {
    /// Create a failure log sharing the given pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn record(&self, kind: &str, reference: &str, error: &str) -> Result<(), RelayError> {
        sqlx::query(
            "INSERT INTO side_effect_failures (id, kind, reference, error, created_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(kind)
        .bind(reference)
        .bind(error)
        .bind(format_ts(Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(|e| RelayError::Store(format!("failure log write failed: {e}")))?;

        debug!("side effect {kind} [{reference}] failed: {}", truncate(error, 120));
        Ok(())
    }

    /// Most recent failures first.
    pub async fn recent(&self, limit: usize) -> Result<Vec<FailureEntry>, RelayError> {
        let found: Vec<(String, String, String, String)> = sqlx::query_as(
            "SELECT kind, reference, error, created_at FROM side_effect_failures \
             ORDER BY created_at DESC, rowid DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RelayError::Store(format!("query failed: {e}")))?;

        Ok(found
            .into_iter()
            .map(|(kind, reference, error, created_at)| FailureEntry {
                kind,
                reference,
                error,
                created_at: parse_ts(&created_at).unwrap_or_else(Utc::now),
            })
            .collect())
    }

    pub async fn count(&self) -> Result<i64, RelayError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM side_effect_failures")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| RelayError::Store(format!("query failed: {e}")))?;
        Ok(count)
    }
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
