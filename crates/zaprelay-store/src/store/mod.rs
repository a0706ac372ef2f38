//! SQLite-backed relay datastore.
//!
//! Split into focused submodules:
//! - `integrations`: CRM credentials and feature flags
//! - `instances`: messaging-provider connections and their lifecycle
//! - `contacts`: contact upsert and the identity resolver
//! - `conversations`: open-conversation lookup, attendance, bot state
//! - `messages`: idempotent message ingestion and delivery status
//! - `mappings`: instance ↔ CRM line associations
//! - `queue`: durable CRM event inbox with atomic claims
//! - `flows`: automation flow definitions

mod contacts;
mod conversations;
mod flows;
mod instances;
mod integrations;
mod mappings;
mod messages;
mod queue;
mod rows;

pub use flows::NewFlow;
pub use queue::QueueCounts;

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use tracing::info;
use zaprelay_core::{config::StoreConfig, error::RelayError, model::format_ts, shellexpand};

/// Relay datastore backed by SQLite.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (or create) the database file, running migrations on first use.
    pub async fn new(config: &StoreConfig) -> Result<Self, RelayError> {
        let db_path = shellexpand(&config.db_path);

        // Ensure parent directory exists.
        if let Some(parent) = std::path::Path::new(&db_path).parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| RelayError::Store(format!("failed to create data dir: {e}")))?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{db_path}"))
            .map_err(|e| RelayError::Store(format!("invalid db path: {e}")))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await
            .map_err(|e| RelayError::Store(format!("failed to connect to sqlite: {e}")))?;

        Self::run_migrations(&pool).await?;

        info!("relay store initialized at {db_path}");

        Ok(Self { pool })
    }

    /// A private in-memory database, migrated. Single connection so every
    /// query sees the same database.
    pub async fn in_memory() -> Result<Self, RelayError> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| RelayError::Store(format!("invalid db path: {e}")))?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await
            .map_err(|e| RelayError::Store(format!("failed to connect to sqlite: {e}")))?;
        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// Get a reference to the underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Get the database file size in bytes.
    pub async fn db_size(&self) -> Result<u64, RelayError> {
        let (page_count,): (i64,) = sqlx::query_as("PRAGMA page_count")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| RelayError::Store(format!("pragma failed: {e}")))?;

        let (page_size,): (i64,) = sqlx::query_as("PRAGMA page_size")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| RelayError::Store(format!("pragma failed: {e}")))?;

        Ok((page_count * page_size) as u64)
    }

    /// Run SQL migrations, tracking which have already been applied.
    async fn run_migrations(pool: &SqlitePool) -> Result<(), RelayError> {
        sqlx::raw_sql(
            "CREATE TABLE IF NOT EXISTS _migrations (
                name TEXT PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            );",
        )
        .execute(pool)
        .await
        .map_err(|e| RelayError::Store(format!("failed to create migrations table: {e}")))?;

        let migrations: &[(&str, &str)] = &[
            ("001_init", include_str!("../../migrations/001_init.sql")),
            (
                "002_side_effect_failures",
                include_str!("../../migrations/002_side_effect_failures.sql"),
            ),
        ];

        for (name, sql) in migrations {
            let applied: Option<(String,)> =
                sqlx::query_as("SELECT name FROM _migrations WHERE name = ?")
                    .bind(name)
                    .fetch_optional(pool)
                    .await
                    .map_err(|e| {
                        RelayError::Store(format!("failed to check migration {name}: {e}"))
                    })?;

            if applied.is_some() {
                continue;
            }

            sqlx::raw_sql(sql)
                .execute(pool)
                .await
                .map_err(|e| RelayError::Store(format!("migration {name} failed: {e}")))?;

            sqlx::query("INSERT INTO _migrations (name) VALUES (?)")
                .bind(name)
                .execute(pool)
                .await
                .map_err(|e| {
                    RelayError::Store(format!("failed to record migration {name}: {e}"))
                })?;
        }
        Ok(())
    }
}

/// Current time in storage format.
pub(crate) fn now() -> String {
    format_ts(Utc::now())
}
