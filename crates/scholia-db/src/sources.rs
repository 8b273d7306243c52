//! Repository for the harvest_sources table.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::debug;
use uuid::Uuid;

use crate::database::Database;
use crate::error::{DbError, Result};
use crate::models::{CursorPolicy, HarvestSource, HarvestStatus, NewHarvestSource};

#[derive(Clone)]
pub struct HarvestSourceRepository {
    db: Database,
}

impl HarvestSourceRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn insert(&self, new: &NewHarvestSource) -> Result<HarvestSource> {
        let source = HarvestSource {
            id: Uuid::new_v4(),
            name: new.name.clone(),
            endpoint_url: new.endpoint_url.clone(),
            metadata_format: new.metadata_format.clone(),
            set_spec: new.set_spec.clone(),
            providers: new.providers.clone(),
            status: HarvestStatus::Active,
            schedule: new.schedule.clone(),
            cursor_policy: new.cursor_policy,
            resume_cursor: None,
            last_harvested: None,
            created_at: Utc::now(),
        };

        sqlx::query(
            r#"
            INSERT INTO harvest_sources
                (id, name, endpoint_url, metadata_format, set_spec, providers,
                 status, schedule, cursor_policy, resume_cursor, last_harvested, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, NULL, ?)
            "#,
        )
        .bind(source.id.to_string())
        .bind(&source.name)
        .bind(&source.endpoint_url)
        .bind(&source.metadata_format)
        .bind(&source.set_spec)
        .bind(serde_json::to_string(&source.providers)?)
        .bind(source.status.as_str())
        .bind(&source.schedule)
        .bind(source.cursor_policy.as_str())
        .bind(source.created_at)
        .execute(self.db.pool())
        .await?;

        debug!(source_id = %source.id, name = %source.name, "created harvest source");
        Ok(source)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<HarvestSource>> {
        let row = sqlx::query("SELECT * FROM harvest_sources WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(self.db.pool())
            .await?;
        row.map(|r| source_from_row(&r)).transpose()
    }

    pub async fn list(&self) -> Result<Vec<HarvestSource>> {
        let rows = sqlx::query("SELECT * FROM harvest_sources ORDER BY created_at")
            .fetch_all(self.db.pool())
            .await?;
        rows.iter().map(source_from_row).collect()
    }

    /// Point-in-time snapshot of sources eligible for search fan-out.
    /// A source mid-harvest is still searchable.
    pub async fn list_active(&self) -> Result<Vec<HarvestSource>> {
        let rows = sqlx::query(
            "SELECT * FROM harvest_sources WHERE status IN ('active', 'harvesting') \
             ORDER BY created_at",
        )
        .fetch_all(self.db.pool())
        .await?;
        rows.iter().map(source_from_row).collect()
    }

    /// Operator edits: everything except the machine-owned fields
    /// (status, cursor, last_harvested).
    pub async fn update(&self, source: &HarvestSource) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE harvest_sources
            SET name = ?, endpoint_url = ?, metadata_format = ?, set_spec = ?,
                providers = ?, schedule = ?, cursor_policy = ?
            WHERE id = ?
            "#,
        )
        .bind(&source.name)
        .bind(&source.endpoint_url)
        .bind(&source.metadata_format)
        .bind(&source.set_spec)
        .bind(serde_json::to_string(&source.providers)?)
        .bind(&source.schedule)
        .bind(source.cursor_policy.as_str())
        .bind(source.id.to_string())
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Operator enable/disable. A disabled source keeps its schedule
    /// but is only harvested by explicit trigger.
    pub async fn set_status(&self, id: Uuid, status: HarvestStatus) -> Result<()> {
        sqlx::query("UPDATE harvest_sources SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id.to_string())
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    /// Atomic idle -> harvesting transition. Returns false when the
    /// source is already harvesting (or missing), so two simultaneous
    /// triggers cannot both win.
    pub async fn try_mark_harvesting(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE harvest_sources SET status = 'harvesting' \
             WHERE id = ? AND status IN ('active', 'inactive', 'error')",
        )
        .bind(id.to_string())
        .execute(self.db.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Persist the cursor returned by the provider after a page commit.
    pub async fn save_cursor(&self, id: Uuid, cursor: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE harvest_sources SET resume_cursor = ? WHERE id = ?")
            .bind(cursor)
            .bind(id.to_string())
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    /// Terminal transition after a successful run.
    pub async fn complete(&self, id: Uuid, cursor: Option<&str>) -> Result<()> {
        sqlx::query(
            "UPDATE harvest_sources \
             SET status = 'active', resume_cursor = ?, last_harvested = ? \
             WHERE id = ?",
        )
        .bind(cursor)
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    /// Terminal transition after retry exhaustion. The cursor keeps its
    /// last persisted value so a re-trigger resumes rather than restarts.
    pub async fn fail(&self, id: Uuid) -> Result<()> {
        sqlx::query("UPDATE harvest_sources SET status = 'error' WHERE id = ?")
            .bind(id.to_string())
            .execute(self.db.pool())
            .await?;
        Ok(())
    }

    /// Deletes the source; harvest logs cascade.
    pub async fn delete(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM harvest_sources WHERE id = ?")
            .bind(id.to_string())
            .execute(self.db.pool())
            .await?;
        Ok(result.rows_affected() == 1)
    }
}

fn source_from_row(row: &SqliteRow) -> Result<HarvestSource> {
    let id: String = row.try_get("id")?;
    let status: String = row.try_get("status")?;
    let cursor_policy: String = row.try_get("cursor_policy")?;
    let providers: String = row.try_get("providers")?;

    Ok(HarvestSource {
        id: Uuid::parse_str(&id).map_err(|e| DbError::Corrupt(format!("source id: {e}")))?,
        name: row.try_get("name")?,
        endpoint_url: row.try_get("endpoint_url")?,
        metadata_format: row.try_get("metadata_format")?,
        set_spec: row.try_get("set_spec")?,
        providers: serde_json::from_str(&providers)?,
        status: HarvestStatus::parse(&status)
            .ok_or_else(|| DbError::Corrupt(format!("source status: {status}")))?,
        schedule: row.try_get("schedule")?,
        cursor_policy: CursorPolicy::parse(&cursor_policy)
            .ok_or_else(|| DbError::Corrupt(format!("cursor policy: {cursor_policy}")))?,
        resume_cursor: row.try_get("resume_cursor")?,
        last_harvested: row.try_get::<Option<DateTime<Utc>>, _>("last_harvested")?,
        created_at: row.try_get("created_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CursorPolicy;

    async fn repo() -> HarvestSourceRepository {
        let db = Database::in_memory().await.unwrap();
        db.initialize().await.unwrap();
        HarvestSourceRepository::new(db)
    }

    fn new_source(name: &str) -> NewHarvestSource {
        NewHarvestSource {
            name: name.to_string(),
            endpoint_url: "https://repo.example.org/oai".to_string(),
            metadata_format: "oai_dc".to_string(),
            set_spec: None,
            providers: vec!["example".to_string()],
            schedule: Some("every 6h".to_string()),
            cursor_policy: CursorPolicy::Reset,
        }
    }

    #[tokio::test]
    async fn test_insert_and_roundtrip() {
        let repo = repo().await;
        let created = repo.insert(&new_source("Example")).await.unwrap();

        let loaded = repo.get(created.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "Example");
        assert_eq!(loaded.status, HarvestStatus::Active);
        assert_eq!(loaded.providers, vec!["example".to_string()]);
        assert_eq!(loaded.schedule.as_deref(), Some("every 6h"));
        assert!(loaded.resume_cursor.is_none());
    }

    #[tokio::test]
    async fn test_set_status_toggles_enablement() {
        let repo = repo().await;
        let source = repo.insert(&new_source("Example")).await.unwrap();

        repo.set_status(source.id, HarvestStatus::Inactive)
            .await
            .unwrap();
        let loaded = repo.get(source.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, HarvestStatus::Inactive);

        repo.set_status(source.id, HarvestStatus::Active)
            .await
            .unwrap();
        let loaded = repo.get(source.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, HarvestStatus::Active);
    }

    #[tokio::test]
    async fn test_try_mark_harvesting_is_exclusive() {
        let repo = repo().await;
        let source = repo.insert(&new_source("Example")).await.unwrap();

        assert!(repo.try_mark_harvesting(source.id).await.unwrap());
        // Second claim loses
        assert!(!repo.try_mark_harvesting(source.id).await.unwrap());

        let loaded = repo.get(source.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, HarvestStatus::Harvesting);
    }

    #[tokio::test]
    async fn test_complete_sets_last_harvested_and_clears_cursor() {
        let repo = repo().await;
        let source = repo.insert(&new_source("Example")).await.unwrap();

        repo.try_mark_harvesting(source.id).await.unwrap();
        repo.save_cursor(source.id, Some("token-3")).await.unwrap();
        repo.complete(source.id, None).await.unwrap();

        let loaded = repo.get(source.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, HarvestStatus::Active);
        assert!(loaded.resume_cursor.is_none());
        assert!(loaded.last_harvested.is_some());
    }

    #[tokio::test]
    async fn test_fail_retains_cursor_and_allows_retrigger() {
        let repo = repo().await;
        let source = repo.insert(&new_source("Example")).await.unwrap();

        repo.try_mark_harvesting(source.id).await.unwrap();
        repo.save_cursor(source.id, Some("token-1")).await.unwrap();
        repo.fail(source.id).await.unwrap();

        let loaded = repo.get(source.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, HarvestStatus::Error);
        assert_eq!(loaded.resume_cursor.as_deref(), Some("token-1"));

        // An errored source can be re-triggered
        assert!(repo.try_mark_harvesting(source.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_active_includes_harvesting() {
        let repo = repo().await;
        let a = repo.insert(&new_source("A")).await.unwrap();
        let _b = repo.insert(&new_source("B")).await.unwrap();

        repo.try_mark_harvesting(a.id).await.unwrap();
        let active = repo.list_active().await.unwrap();
        assert_eq!(active.len(), 2);
    }
}
