//! Repository for the harvest_logs table.
//!
//! A log row is created when a run starts, receives append-only count
//! increments while the run is in flight, and is finalized exactly once.
//! No run ever touches another run's row.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use crate::database::Database;
use crate::error::{DbError, Result};
use crate::models::{HarvestLog, HarvestLogStatus};

#[derive(Clone)]
pub struct HarvestLogRepository {
    db: Database,
}

/// Aggregate view for the metrics endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct HarvestMetrics {
    pub total_runs: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub records_processed: i64,
    pub records_added: i64,
    pub records_updated: i64,
    pub records_failed: i64,
}

impl HarvestLogRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn create_running(&self, source_id: Uuid) -> Result<HarvestLog> {
        let log = HarvestLog {
            id: Uuid::new_v4(),
            source_id,
            started_at: Utc::now(),
            finished_at: None,
            status: HarvestLogStatus::Running,
            records_processed: 0,
            records_added: 0,
            records_updated: 0,
            records_failed: 0,
            error_message: None,
        };

        sqlx::query(
            r#"
            INSERT INTO harvest_logs
                (id, source_id, started_at, finished_at, status,
                 records_processed, records_added, records_updated, records_failed,
                 error_message)
            VALUES (?, ?, ?, NULL, 'running', 0, 0, 0, 0, NULL)
            "#,
        )
        .bind(log.id.to_string())
        .bind(log.source_id.to_string())
        .bind(log.started_at)
        .execute(self.db.pool())
        .await?;

        Ok(log)
    }

    /// Append-only count increments for one page of work.
    pub async fn add_counts(
        &self,
        log_id: Uuid,
        processed: i64,
        added: i64,
        updated: i64,
        failed: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE harvest_logs
            SET records_processed = records_processed + ?,
                records_added     = records_added + ?,
                records_updated   = records_updated + ?,
                records_failed    = records_failed + ?
            WHERE id = ?
            "#,
        )
        .bind(processed)
        .bind(added)
        .bind(updated)
        .bind(failed)
        .bind(log_id.to_string())
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Set the terminal status and end time.
    pub async fn finalize(
        &self,
        log_id: Uuid,
        status: HarvestLogStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE harvest_logs SET status = ?, finished_at = ?, error_message = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(error_message)
        .bind(log_id.to_string())
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    pub async fn get(&self, log_id: Uuid) -> Result<Option<HarvestLog>> {
        let row = sqlx::query("SELECT * FROM harvest_logs WHERE id = ?")
            .bind(log_id.to_string())
            .fetch_optional(self.db.pool())
            .await?;
        row.map(|r| log_from_row(&r)).transpose()
    }

    pub async fn list(&self, limit: i64) -> Result<Vec<HarvestLog>> {
        let rows = sqlx::query("SELECT * FROM harvest_logs ORDER BY started_at DESC LIMIT ?")
            .bind(limit)
            .fetch_all(self.db.pool())
            .await?;
        rows.iter().map(log_from_row).collect()
    }

    pub async fn list_for_source(&self, source_id: Uuid) -> Result<Vec<HarvestLog>> {
        let rows =
            sqlx::query("SELECT * FROM harvest_logs WHERE source_id = ? ORDER BY started_at DESC")
                .bind(source_id.to_string())
                .fetch_all(self.db.pool())
                .await?;
        rows.iter().map(log_from_row).collect()
    }

    pub async fn running_for_source(&self, source_id: Uuid) -> Result<Option<HarvestLog>> {
        let row = sqlx::query(
            "SELECT * FROM harvest_logs WHERE source_id = ? AND status = 'running' \
             ORDER BY started_at DESC LIMIT 1",
        )
        .bind(source_id.to_string())
        .fetch_optional(self.db.pool())
        .await?;
        row.map(|r| log_from_row(&r)).transpose()
    }

    pub async fn metrics(&self) -> Result<HarvestMetrics> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*)                                              AS total_runs,
                COALESCE(SUM(status = 'running'), 0)                  AS running,
                COALESCE(SUM(status = 'completed'), 0)                AS completed,
                COALESCE(SUM(status = 'failed'), 0)                   AS failed,
                COALESCE(SUM(records_processed), 0)                   AS records_processed,
                COALESCE(SUM(records_added), 0)                       AS records_added,
                COALESCE(SUM(records_updated), 0)                     AS records_updated,
                COALESCE(SUM(records_failed), 0)                      AS records_failed
            FROM harvest_logs
            "#,
        )
        .fetch_one(self.db.pool())
        .await?;

        Ok(HarvestMetrics {
            total_runs: row.try_get("total_runs")?,
            running: row.try_get("running")?,
            completed: row.try_get("completed")?,
            failed: row.try_get("failed")?,
            records_processed: row.try_get("records_processed")?,
            records_added: row.try_get("records_added")?,
            records_updated: row.try_get("records_updated")?,
            records_failed: row.try_get("records_failed")?,
        })
    }
}

fn log_from_row(row: &SqliteRow) -> Result<HarvestLog> {
    let id: String = row.try_get("id")?;
    let source_id: String = row.try_get("source_id")?;
    let status: String = row.try_get("status")?;

    Ok(HarvestLog {
        id: Uuid::parse_str(&id).map_err(|e| DbError::Corrupt(format!("log id: {e}")))?,
        source_id: Uuid::parse_str(&source_id)
            .map_err(|e| DbError::Corrupt(format!("log source id: {e}")))?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get::<Option<DateTime<Utc>>, _>("finished_at")?,
        status: HarvestLogStatus::parse(&status)
            .ok_or_else(|| DbError::Corrupt(format!("log status: {status}")))?,
        records_processed: row.try_get("records_processed")?,
        records_added: row.try_get("records_added")?,
        records_updated: row.try_get("records_updated")?,
        records_failed: row.try_get("records_failed")?,
        error_message: row.try_get("error_message")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewHarvestSource;
    use crate::sources::HarvestSourceRepository;

    async fn setup() -> (HarvestSourceRepository, HarvestLogRepository, Uuid) {
        let db = Database::in_memory().await.unwrap();
        db.initialize().await.unwrap();
        let sources = HarvestSourceRepository::new(db.clone());
        let logs = HarvestLogRepository::new(db);
        let source = sources
            .insert(&NewHarvestSource {
                name: "Example".to_string(),
                endpoint_url: "https://repo.example.org/oai".to_string(),
                metadata_format: "oai_dc".to_string(),
                set_spec: None,
                providers: vec![],
                schedule: None,
                cursor_policy: Default::default(),
            })
            .await
            .unwrap();
        (sources, logs, source.id)
    }

    #[tokio::test]
    async fn test_create_and_finalize() {
        let (_, logs, source_id) = setup().await;
        let log = logs.create_running(source_id).await.unwrap();

        logs.add_counts(log.id, 10, 8, 2, 0).await.unwrap();
        logs.add_counts(log.id, 10, 10, 0, 0).await.unwrap();
        logs.finalize(log.id, HarvestLogStatus::Completed, None)
            .await
            .unwrap();

        let loaded = logs.get(log.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, HarvestLogStatus::Completed);
        assert_eq!(loaded.records_processed, 20);
        assert_eq!(loaded.records_added, 18);
        assert_eq!(loaded.records_updated, 2);
        assert!(loaded.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_failed_run_records_error() {
        let (_, logs, source_id) = setup().await;
        let log = logs.create_running(source_id).await.unwrap();

        logs.finalize(log.id, HarvestLogStatus::Failed, Some("network: HTTP 503"))
            .await
            .unwrap();

        let loaded = logs.get(log.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, HarvestLogStatus::Failed);
        assert_eq!(loaded.error_message.as_deref(), Some("network: HTTP 503"));
    }

    #[tokio::test]
    async fn test_metrics_aggregation() {
        let (_, logs, source_id) = setup().await;
        let a = logs.create_running(source_id).await.unwrap();
        logs.add_counts(a.id, 30, 30, 0, 0).await.unwrap();
        logs.finalize(a.id, HarvestLogStatus::Completed, None)
            .await
            .unwrap();
        let _b = logs.create_running(source_id).await.unwrap();

        let metrics = logs.metrics().await.unwrap();
        assert_eq!(metrics.total_runs, 2);
        assert_eq!(metrics.running, 1);
        assert_eq!(metrics.completed, 1);
        assert_eq!(metrics.records_processed, 30);
    }
}
