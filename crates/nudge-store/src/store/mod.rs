//! SQLite-backed prompt store.
//!
//! Split into focused submodules:
//! - `prompts` — prompt lifecycle: creation with in-flight dedup, CAS state
//!   transitions, parking, reclaim and expiry queries
//! - `stats` — delivery statistics feeding the frequency controller
//! - `preferences` — read-only per-user notification preferences
//! - `snapshots` — read-only user-state views for the timing detector

mod preferences;
mod prompts;
mod snapshots;
mod stats;

pub use prompts::{QueueCandidate, RetryDisposition};

use chrono::{DateTime, NaiveDateTime, Utc};
use nudge_core::{config::shellexpand, config::StoreConfig, error::NudgeError};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use tracing::info;

/// Persistent prompt store backed by SQLite.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Create a new store, running migrations on first use.
    ///
    /// A `db_path` of `:memory:` opens an in-memory database on a single
    /// connection (used by tests and `--dry-run` style tooling).
    pub async fn new(config: &StoreConfig) -> Result<Self, NudgeError> {
        let in_memory = config.db_path == ":memory:";
        let (url, max_connections) = if in_memory {
            ("sqlite::memory:".to_string(), 1)
        } else {
            let db_path = shellexpand(&config.db_path);
            if let Some(parent) = std::path::Path::new(&db_path).parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| NudgeError::Store(format!("failed to create data dir: {e}")))?;
            }
            (format!("sqlite:{db_path}"), 4)
        };

        let mut opts = SqliteConnectOptions::from_str(&url)
            .map_err(|e| NudgeError::Store(format!("invalid db path: {e}")))?
            .create_if_missing(true);
        if !in_memory {
            opts = opts.journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await
            .map_err(|e| NudgeError::Store(format!("failed to connect to sqlite: {e}")))?;

        Self::run_migrations(&pool).await?;

        info!("Prompt store initialized at {url}");

        Ok(Self { pool })
    }

    /// Get a reference to the underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Run SQL migrations, tracking which have already been applied.
    async fn run_migrations(pool: &SqlitePool) -> Result<(), NudgeError> {
        sqlx::raw_sql(
            "CREATE TABLE IF NOT EXISTS _migrations (
                name TEXT PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            );",
        )
        .execute(pool)
        .await
        .map_err(|e| NudgeError::Store(format!("failed to create migrations table: {e}")))?;

        let migrations: &[(&str, &str)] = &[
            ("001_init", include_str!("../../migrations/001_init.sql")),
            (
                "002_delivery_log",
                include_str!("../../migrations/002_delivery_log.sql"),
            ),
        ];

        for (name, sql) in migrations {
            let applied: Option<(String,)> =
                sqlx::query_as("SELECT name FROM _migrations WHERE name = ?")
                    .bind(name)
                    .fetch_optional(pool)
                    .await
                    .map_err(|e| {
                        NudgeError::Store(format!("failed to check migration {name}: {e}"))
                    })?;

            if applied.is_some() {
                continue;
            }

            sqlx::raw_sql(sql)
                .execute(pool)
                .await
                .map_err(|e| NudgeError::Store(format!("migration {name} failed: {e}")))?;

            sqlx::query("INSERT INTO _migrations (name) VALUES (?)")
                .bind(name)
                .execute(pool)
                .await
                .map_err(|e| {
                    NudgeError::Store(format!("failed to record migration {name}: {e}"))
                })?;
        }
        Ok(())
    }
}

/// Format a timestamp the way sqlite's `datetime('now')` does, so stored
/// values compare correctly in SQL.
pub(crate) fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Parse a timestamp written by `fmt_ts` or sqlite's `datetime('now')`.
pub(crate) fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .ok()
        .map(|n| n.and_utc())
}

#[cfg(test)]
mod tests;
