//! Repository for the metadata_records table.
//!
//! Records are upserted keyed on (provider, record_id) so re-harvesting
//! the same identifier updates in place instead of duplicating.

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::database::Database;
use crate::error::Result;
use crate::models::{MetadataRecord, UpsertOutcome};

/// Optional narrowing applied on top of the keyword term. Every clause
/// runs in SQL, so the reported total counts exactly the rows a full
/// scan of the result pages would return.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    /// Provider allow-list; empty means all providers.
    pub providers: Vec<String>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    /// Case-insensitive substring matches against the author list; a
    /// record qualifies when any filter entry matches.
    pub authors: Vec<String>,
}

#[derive(Clone)]
pub struct MetadataRecordRepository {
    db: Database,
}

impl MetadataRecordRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert-or-update keyed on (provider, record_id).
    pub async fn upsert(&self, record: &MetadataRecord) -> Result<UpsertOutcome> {
        let existed = sqlx::query(
            "SELECT 1 FROM metadata_records WHERE provider = ? AND record_id = ?",
        )
        .bind(&record.provider)
        .bind(&record.record_id)
        .fetch_optional(self.db.pool())
        .await?
        .is_some();

        sqlx::query(
            r#"
            INSERT INTO metadata_records
                (provider, record_id, title, authors, abstract_text, published,
                 doi, url, keywords, harvested_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (provider, record_id) DO UPDATE SET
                title         = excluded.title,
                authors       = excluded.authors,
                abstract_text = excluded.abstract_text,
                published     = excluded.published,
                doi           = excluded.doi,
                url           = excluded.url,
                keywords      = excluded.keywords,
                harvested_at  = excluded.harvested_at
            "#,
        )
        .bind(&record.provider)
        .bind(&record.record_id)
        .bind(&record.title)
        .bind(serde_json::to_string(&record.authors)?)
        .bind(&record.abstract_text)
        .bind(record.published)
        .bind(&record.doi)
        .bind(&record.url)
        .bind(serde_json::to_string(&record.keywords)?)
        .bind(record.harvested_at)
        .execute(self.db.pool())
        .await?;

        Ok(if existed {
            UpsertOutcome::Updated
        } else {
            UpsertOutcome::Inserted
        })
    }

    pub async fn get(&self, provider: &str, record_id: &str) -> Result<Option<MetadataRecord>> {
        let row = sqlx::query(
            "SELECT * FROM metadata_records WHERE provider = ? AND record_id = ?",
        )
        .bind(provider)
        .bind(record_id)
        .fetch_optional(self.db.pool())
        .await?;
        row.map(|r| record_from_row(&r)).transpose()
    }

    pub async fn count(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM metadata_records")
            .fetch_one(self.db.pool())
            .await?;
        Ok(row.try_get("n")?)
    }

    /// Keyword search over title and abstract, newest first, narrowed
    /// by the filter. Returns one page plus the total match count; the
    /// count sees the same WHERE clause as the page, so it never
    /// overstates what paging through would yield.
    pub async fn search(
        &self,
        term: &str,
        filter: &RecordFilter,
        page: u32,
        limit: u32,
    ) -> Result<(Vec<MetadataRecord>, u64)> {
        let pattern = format!("%{}%", term.to_lowercase());
        let author_patterns: Vec<String> = filter
            .authors
            .iter()
            .map(|a| format!("%{}%", a.to_lowercase()))
            .collect();
        let clauses = filter_clauses(filter);

        let count_sql = format!(
            "SELECT COUNT(*) AS n FROM metadata_records \
             WHERE (LOWER(title) LIKE ? OR LOWER(COALESCE(abstract_text, '')) LIKE ?)\
             {clauses}"
        );
        let count_query = bind_filter(
            sqlx::query(&count_sql).bind(&pattern).bind(&pattern),
            filter,
            &author_patterns,
        );
        let total: i64 = count_query.fetch_one(self.db.pool()).await?.try_get("n")?;

        let select_sql = format!(
            "SELECT * FROM metadata_records \
             WHERE (LOWER(title) LIKE ? OR LOWER(COALESCE(abstract_text, '')) LIKE ?)\
             {clauses} \
             ORDER BY published DESC NULLS LAST, record_id \
             LIMIT ? OFFSET ?"
        );
        let offset = i64::from(page.saturating_sub(1)) * i64::from(limit);
        let rows = bind_filter(
            sqlx::query(&select_sql).bind(&pattern).bind(&pattern),
            filter,
            &author_patterns,
        )
        .bind(i64::from(limit))
        .bind(offset)
        .fetch_all(self.db.pool())
        .await?;

        let records = rows
            .iter()
            .map(record_from_row)
            .collect::<Result<Vec<_>>>()?;
        Ok((records, total as u64))
    }
}

fn filter_clauses(filter: &RecordFilter) -> String {
    let mut clauses = String::new();
    if !filter.providers.is_empty() {
        let placeholders = vec!["?"; filter.providers.len()].join(", ");
        clauses.push_str(&format!(" AND provider IN ({placeholders})"));
    }
    // NULL published never satisfies a date bound
    if filter.date_from.is_some() {
        clauses.push_str(" AND published >= ?");
    }
    if filter.date_to.is_some() {
        clauses.push_str(" AND published <= ?");
    }
    if !filter.authors.is_empty() {
        let alternatives = vec!["LOWER(authors) LIKE ?"; filter.authors.len()].join(" OR ");
        clauses.push_str(&format!(" AND ({alternatives})"));
    }
    clauses
}

fn bind_filter<'q>(
    mut query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    filter: &'q RecordFilter,
    author_patterns: &'q [String],
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    for provider in &filter.providers {
        query = query.bind(provider);
    }
    if let Some(from) = filter.date_from {
        query = query.bind(from);
    }
    if let Some(to) = filter.date_to {
        query = query.bind(to);
    }
    for pattern in author_patterns {
        query = query.bind(pattern);
    }
    query
}

fn record_from_row(row: &SqliteRow) -> Result<MetadataRecord> {
    let authors: String = row.try_get("authors")?;
    let keywords: String = row.try_get("keywords")?;

    Ok(MetadataRecord {
        provider: row.try_get("provider")?,
        record_id: row.try_get("record_id")?,
        title: row.try_get("title")?,
        authors: serde_json::from_str(&authors)?,
        abstract_text: row.try_get("abstract_text")?,
        published: row.try_get::<Option<NaiveDate>, _>("published")?,
        doi: row.try_get("doi")?,
        url: row.try_get("url")?,
        keywords: serde_json::from_str(&keywords)?,
        harvested_at: row.try_get::<DateTime<Utc>, _>("harvested_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RecordAuthor;

    async fn repo() -> MetadataRecordRepository {
        let db = Database::in_memory().await.unwrap();
        db.initialize().await.unwrap();
        MetadataRecordRepository::new(db)
    }

    fn record(provider: &str, id: &str, title: &str) -> MetadataRecord {
        MetadataRecord {
            provider: provider.to_string(),
            record_id: id.to_string(),
            title: title.to_string(),
            authors: vec![RecordAuthor {
                name: "Ada Lovelace".to_string(),
                affiliation: None,
            }],
            abstract_text: Some("A study of analytical engines.".to_string()),
            published: NaiveDate::from_ymd_opt(2024, 3, 1),
            doi: None,
            url: None,
            keywords: vec!["computing".to_string()],
            harvested_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_upsert_inserts_then_updates() {
        let repo = repo().await;
        let mut r = record("example", "oai:1", "First title");

        assert_eq!(repo.upsert(&r).await.unwrap(), UpsertOutcome::Inserted);

        r.title = "Revised title".to_string();
        assert_eq!(repo.upsert(&r).await.unwrap(), UpsertOutcome::Updated);

        assert_eq!(repo.count().await.unwrap(), 1);
        let loaded = repo.get("example", "oai:1").await.unwrap().unwrap();
        assert_eq!(loaded.title, "Revised title");
        assert_eq!(loaded.authors[0].name, "Ada Lovelace");
    }

    #[tokio::test]
    async fn test_same_record_id_different_providers_do_not_collide() {
        let repo = repo().await;
        repo.upsert(&record("a", "oai:1", "From A")).await.unwrap();
        repo.upsert(&record("b", "oai:1", "From B")).await.unwrap();
        assert_eq!(repo.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_search_matches_title_and_abstract() {
        let repo = repo().await;
        repo.upsert(&record("a", "1", "Analytical engines")).await.unwrap();
        repo.upsert(&record("a", "2", "Unrelated")).await.unwrap();

        let all = RecordFilter::default();
        let (hits, total) = repo.search("analytical", &all, 1, 10).await.unwrap();
        // "analytical" appears in record 1's title and both abstracts
        assert_eq!(total, 2);
        assert_eq!(hits.len(), 2);

        let (_, total) = repo.search("engines", &all, 1, 10).await.unwrap();
        assert_eq!(total, 2);

        let (hits, total) = repo.search("unrelated", &all, 1, 10).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(hits[0].record_id, "2");
    }

    #[tokio::test]
    async fn test_search_provider_allow_list() {
        let repo = repo().await;
        repo.upsert(&record("a", "1", "Engines")).await.unwrap();
        repo.upsert(&record("b", "2", "Engines")).await.unwrap();

        let filter = RecordFilter {
            providers: vec!["a".to_string()],
            ..Default::default()
        };
        let (hits, total) = repo.search("engines", &filter, 1, 10).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(hits[0].provider, "a");
    }

    #[tokio::test]
    async fn test_search_pagination() {
        let repo = repo().await;
        for i in 0..25 {
            repo.upsert(&record("a", &format!("id-{i}"), "Engines"))
                .await
                .unwrap();
        }

        let all = RecordFilter::default();
        let (page1, total) = repo.search("engines", &all, 1, 10).await.unwrap();
        let (page3, _) = repo.search("engines", &all, 3, 10).await.unwrap();
        assert_eq!(total, 25);
        assert_eq!(page1.len(), 10);
        assert_eq!(page3.len(), 5);
    }

    #[tokio::test]
    async fn test_date_filter_bounds_rows_and_total() {
        let repo = repo().await;
        let mut old = record("a", "old", "Engines");
        old.published = NaiveDate::from_ymd_opt(2010, 1, 1);
        repo.upsert(&old).await.unwrap();
        let mut undated = record("a", "undated", "Engines");
        undated.published = None;
        repo.upsert(&undated).await.unwrap();
        repo.upsert(&record("a", "recent", "Engines")).await.unwrap();

        let filter = RecordFilter {
            date_from: NaiveDate::from_ymd_opt(2020, 1, 1),
            ..Default::default()
        };
        let (hits, total) = repo.search("engines", &filter, 1, 10).await.unwrap();
        // The undated and out-of-range rows are excluded from the count
        // too, not just from the page
        assert_eq!(total, 1);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record_id, "recent");

        let filter = RecordFilter {
            date_to: NaiveDate::from_ymd_opt(2015, 1, 1),
            ..Default::default()
        };
        let (hits, total) = repo.search("engines", &filter, 1, 10).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(hits[0].record_id, "old");
    }

    #[tokio::test]
    async fn test_author_filter_bounds_rows_and_total() {
        let repo = repo().await;
        repo.upsert(&record("a", "1", "Engines")).await.unwrap();
        let mut other = record("a", "2", "Engines");
        other.authors = vec![RecordAuthor {
            name: "Charles Babbage".to_string(),
            affiliation: None,
        }];
        repo.upsert(&other).await.unwrap();

        let filter = RecordFilter {
            authors: vec!["lovelace".to_string()],
            ..Default::default()
        };
        let (hits, total) = repo.search("engines", &filter, 1, 10).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(hits[0].record_id, "1");

        // Any matching filter entry qualifies a record
        let filter = RecordFilter {
            authors: vec!["lovelace".to_string(), "babbage".to_string()],
            ..Default::default()
        };
        let (_, total) = repo.search("engines", &filter, 1, 10).await.unwrap();
        assert_eq!(total, 2);
    }
}
