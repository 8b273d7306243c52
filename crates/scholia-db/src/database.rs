//! Database connection and table management.
//!
//! The handle is constructed once at process start and passed by
//! reference into the dispatcher, harvest runner, and scheduler.

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

use crate::error::Result;

/// Main database handle.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open or create a database at the given sqlx URL.
    pub async fn open(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// In-memory database for tests. Single connection so every query
    /// sees the same memory store.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        // No acquire-time ping: the ping round-trips through sqlite's
        // worker thread, which deadlocks tests run under tokio's paused
        // clock (the acquire timeout auto-advances and fires first).
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .test_before_acquire(false)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create all tables if they don't exist.
    pub async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS harvest_sources (
                id              TEXT PRIMARY KEY,
                name            TEXT NOT NULL,
                endpoint_url    TEXT NOT NULL,
                metadata_format TEXT NOT NULL,
                set_spec        TEXT,
                providers       TEXT NOT NULL DEFAULT '[]',
                status          TEXT NOT NULL,
                schedule        TEXT,
                cursor_policy   TEXT NOT NULL DEFAULT 'reset',
                resume_cursor   TEXT,
                last_harvested  TEXT,
                created_at      TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS harvest_logs (
                id                TEXT PRIMARY KEY,
                source_id         TEXT NOT NULL
                                  REFERENCES harvest_sources(id) ON DELETE CASCADE,
                started_at        TEXT NOT NULL,
                finished_at       TEXT,
                status            TEXT NOT NULL,
                records_processed INTEGER NOT NULL DEFAULT 0,
                records_added     INTEGER NOT NULL DEFAULT 0,
                records_updated   INTEGER NOT NULL DEFAULT 0,
                records_failed    INTEGER NOT NULL DEFAULT 0,
                error_message     TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS metadata_records (
                provider      TEXT NOT NULL,
                record_id     TEXT NOT NULL,
                title         TEXT NOT NULL,
                authors       TEXT NOT NULL DEFAULT '[]',
                abstract_text TEXT,
                published     TEXT,
                doi           TEXT,
                url           TEXT,
                keywords      TEXT NOT NULL DEFAULT '[]',
                harvested_at  TEXT NOT NULL,
                PRIMARY KEY (provider, record_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
