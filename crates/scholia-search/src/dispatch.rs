//! Fan-out dispatcher: runs one query against the selected sources
//! concurrently, bounds each by a wall-clock budget, and merges whatever
//! survives.
//!
//! Remote providers are registered once at startup. Harvested sources
//! are resolved from the database on every request, so a "search all"
//! sees exactly the harvest sources that were active when the request
//! arrived; sources activated mid-request are picked up by the next one.
//!
//! A failed or slow source never fails the query; it is reported in the
//! response's `errors` array instead. The query fails as a whole only
//! when every selected source fails.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use thiserror::Error;
use tokio::time::{timeout, Instant};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::merge::{merge, MergeOptions};
use crate::models::{SearchQuery, SearchResponse, SourceFailure, SourcePage};
use crate::sources::harvested::HarvestedSource;
use crate::sources::SearchSource;
use scholia_db::{Database, DbError, HarvestSourceRepository, MetadataRecordRepository};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("unknown source: {0}")]
    UnknownSource(String),
    #[error("no sources selected")]
    NoSources,
    /// Every selected source failed; the per-source failures ride along.
    #[error("all sources failed")]
    AllSourcesFailed(Vec<SourceFailure>),
    #[error("source lookup failed: {0}")]
    Db(#[from] DbError),
}

/// Which sources a request wants: remote provider ids and/or harvest
/// source uuids. Defaults to everything currently available.
#[derive(Debug, Clone, Default)]
pub struct SourceSelector {
    ids: Option<Vec<String>>,
}

impl SourceSelector {
    pub fn all() -> Self {
        Self { ids: None }
    }

    /// Parses a comma-separated id list ("pubmed,arxiv"). Blank input
    /// or the literal "all" selects every available source.
    pub fn parse(raw: &str) -> Self {
        let ids: Vec<String> = raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_lowercase)
            .filter(|s| s != "all")
            .collect();
        if ids.is_empty() {
            Self::all()
        } else {
            Self { ids: Some(ids) }
        }
    }

    fn ids(&self) -> Option<&[String]> {
        self.ids.as_deref()
    }
}

pub struct SearchDispatcher {
    remotes: Vec<Arc<dyn SearchSource>>,
    harvest_sources: HarvestSourceRepository,
    records: MetadataRecordRepository,
    source_timeout: Duration,
}

impl SearchDispatcher {
    pub fn new(db: Database, source_timeout: Duration) -> Self {
        Self {
            remotes: Vec::new(),
            harvest_sources: HarvestSourceRepository::new(db.clone()),
            records: MetadataRecordRepository::new(db),
            source_timeout,
        }
    }

    /// Registers a remote provider. Dispatch order follows registration
    /// order, with harvested sources appended after the remotes.
    pub fn register(mut self, source: Arc<dyn SearchSource>) -> Self {
        self.remotes.push(source);
        self
    }

    /// Resolves the selector against the registered remotes and a
    /// point-in-time snapshot of the harvest source table.
    async fn select(
        &self,
        selector: &SourceSelector,
    ) -> Result<Vec<Arc<dyn SearchSource>>, DispatchError> {
        let selected = match selector.ids() {
            None => {
                let mut selected = self.remotes.clone();
                for source in self.harvest_sources.list_active().await? {
                    selected.push(Arc::new(HarvestedSource::for_source(
                        &source,
                        self.records.clone(),
                    )) as Arc<dyn SearchSource>);
                }
                selected
            }
            Some(ids) => {
                let mut selected: Vec<Arc<dyn SearchSource>> = Vec::with_capacity(ids.len());
                for id in ids {
                    if let Some(remote) = self.remotes.iter().find(|s| s.id() == id) {
                        selected.push(remote.clone());
                        continue;
                    }
                    // An explicitly addressed harvest source is searched
                    // whatever its status.
                    let source = match Uuid::parse_str(id) {
                        Ok(uuid) => self.harvest_sources.get(uuid).await?,
                        Err(_) => None,
                    };
                    match source {
                        Some(source) => selected.push(Arc::new(HarvestedSource::for_source(
                            &source,
                            self.records.clone(),
                        ))),
                        None => return Err(DispatchError::UnknownSource(id.clone())),
                    }
                }
                selected
            }
        };
        if selected.is_empty() {
            return Err(DispatchError::NoSources);
        }
        Ok(selected)
    }

    /// Fans the query out to the selected sources and merges the
    /// partial results. Dropping the returned future cancels all
    /// in-flight source calls.
    #[instrument(skip(self, query, selector), fields(term = %query.term, page = query.page))]
    pub async fn dispatch(
        &self,
        query: &SearchQuery,
        selector: &SourceSelector,
        options: MergeOptions,
    ) -> Result<SearchResponse, DispatchError> {
        let selected = self.select(selector).await?;
        let started = Instant::now();

        let calls = selected.iter().map(|source| {
            let source = source.clone();
            async move {
                let id = source.id().to_string();
                let outcome = timeout(self.source_timeout, source.search(query)).await;
                (id, outcome)
            }
        });
        let outcomes = join_all(calls).await;

        let mut partials: Vec<(String, SourcePage)> = Vec::new();
        let mut errors: Vec<SourceFailure> = Vec::new();
        for (id, outcome) in outcomes {
            match outcome {
                Ok(Ok(page)) => partials.push((id, page)),
                Ok(Err(error)) => {
                    warn!(source = %id, kind = error.kind.as_str(), "source failed");
                    errors.push(SourceFailure::from_error(id, &error));
                }
                Err(_elapsed) => {
                    warn!(source = %id, "source exceeded the search budget");
                    errors.push(SourceFailure::timeout(id, self.source_timeout.as_secs()));
                }
            }
        }

        if partials.is_empty() {
            return Err(DispatchError::AllSourcesFailed(errors));
        }

        let took_ms = started.elapsed().as_millis() as u64;
        info!(
            sources = partials.len(),
            failed = errors.len(),
            took_ms,
            "search dispatched"
        );
        Ok(merge(query, partials, errors, took_ms, options))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SourcePage, SourceResult};
    use async_trait::async_trait;
    use chrono::Utc;
    use scholia_common::{ErrorKind, SourceError};
    use scholia_db::{MetadataRecord, NewHarvestSource, RecordAuthor};

    /// Scriptable source: fixed delay, then a fixed outcome.
    struct FakeSource {
        id: String,
        delay: Duration,
        outcome: Result<SourcePage, ErrorKind>,
    }

    impl FakeSource {
        fn ok(id: &str, n: usize, total: u64) -> Arc<Self> {
            let results = (0..n)
                .map(|i| SourceResult {
                    id: format!("{id}-{i}"),
                    title: format!("{id} result {i}"),
                    authors: vec![],
                    abstract_text: None,
                    published: None,
                    journal: None,
                    url: None,
                    doi: None,
                    keywords: vec![],
                    source: id.to_string(),
                    extra: serde_json::Map::new(),
                })
                .collect();
            Arc::new(Self {
                id: id.to_string(),
                delay: Duration::ZERO,
                outcome: Ok(SourcePage {
                    results,
                    total_results: total,
                }),
            })
        }

        fn slow(id: &str, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                delay,
                outcome: Ok(SourcePage::default()),
            })
        }

        fn failing(id: &str, kind: ErrorKind) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                delay: Duration::ZERO,
                outcome: Err(kind),
            })
        }
    }

    #[async_trait]
    impl SearchSource for FakeSource {
        fn id(&self) -> &str {
            &self.id
        }

        async fn search(&self, _query: &SearchQuery) -> Result<SourcePage, SourceError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            match &self.outcome {
                Ok(page) => Ok(page.clone()),
                Err(ErrorKind::Auth) => Err(SourceError::auth("bad key")),
                Err(ErrorKind::RateLimit) => Err(SourceError::rate_limit("throttled", None)),
                Err(_) => Err(SourceError::network("down")),
            }
        }
    }

    async fn dispatcher(sources: Vec<Arc<FakeSource>>) -> SearchDispatcher {
        let db = Database::in_memory().await.unwrap();
        db.initialize().await.unwrap();
        // sqlx returns connections to the pool on a spawned task; wait
        // for it so tests that pause the clock next don't race the
        // acquire timeout against a connection still being returned.
        while db.pool().num_idle() == 0 {
            tokio::task::yield_now().await;
        }
        let mut d = SearchDispatcher::new(db, Duration::from_secs(10));
        for source in sources {
            d = d.register(source);
        }
        d
    }

    fn new_source(name: &str) -> NewHarvestSource {
        NewHarvestSource {
            name: name.to_string(),
            endpoint_url: format!("https://{name}.example.org/oai"),
            metadata_format: "oai_dc".to_string(),
            set_spec: None,
            providers: vec![],
            schedule: None,
            cursor_policy: Default::default(),
        }
    }

    fn harvested_record(title: &str) -> MetadataRecord {
        MetadataRecord {
            provider: "repo-a".to_string(),
            record_id: "oai:1".to_string(),
            title: title.to_string(),
            authors: vec![RecordAuthor {
                name: "Grace Hopper".to_string(),
                affiliation: None,
            }],
            abstract_text: None,
            published: None,
            doi: None,
            url: None,
            keywords: vec![],
            harvested_at: Utc::now(),
        }
    }

    // These tests pause tokio's clock only after DB setup: sqlite work
    // happens on a thread the paused runtime can't see, so setting up
    // under `start_paused` auto-advances past the pool acquire timeout.
    #[tokio::test]
    async fn test_partial_failure_returns_survivors_plus_errors() {
        let d = dispatcher(vec![
            FakeSource::ok("a", 5, 50),
            FakeSource::failing("b", ErrorKind::Network),
        ])
        .await;
        tokio::time::pause();
        let mut query = SearchQuery::new("machine learning");
        query.limit = 10;

        let response = d
            .dispatch(&query, &SourceSelector::all(), MergeOptions::default())
            .await
            .unwrap();

        assert_eq!(response.results.len(), 5);
        assert_eq!(response.total_results, 50);
        assert_eq!(response.sources_searched, vec!["a"]);
        assert_eq!(response.errors.len(), 1);
        assert_eq!(response.errors[0].source, "b");
        assert_eq!(response.errors[0].kind, ErrorKind::Network);
    }

    #[tokio::test]
    async fn test_slow_source_reported_as_timeout() {
        let d = dispatcher(vec![
            FakeSource::ok("a", 2, 2),
            FakeSource::slow("b", Duration::from_secs(30)),
        ])
        .await;
        tokio::time::pause();
        let query = SearchQuery::new("q");

        let response = d
            .dispatch(&query, &SourceSelector::all(), MergeOptions::default())
            .await
            .unwrap();

        assert_eq!(response.sources_searched, vec!["a"]);
        assert_eq!(response.errors.len(), 1);
        assert_eq!(response.errors[0].kind, ErrorKind::Timeout);
        assert!(response.errors[0].retryable);
    }

    #[tokio::test]
    async fn test_all_sources_failed_is_an_error() {
        let d = dispatcher(vec![
            FakeSource::failing("a", ErrorKind::Auth),
            FakeSource::failing("b", ErrorKind::Network),
        ])
        .await;
        tokio::time::pause();
        let query = SearchQuery::new("q");

        let err = d
            .dispatch(&query, &SourceSelector::all(), MergeOptions::default())
            .await
            .unwrap_err();

        match err {
            DispatchError::AllSourcesFailed(failures) => {
                assert_eq!(failures.len(), 2);
                assert_eq!(failures[0].kind, ErrorKind::Auth);
                assert!(!failures[0].retryable);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_selector_restricts_and_orders_sources() {
        let d = dispatcher(vec![
            FakeSource::ok("a", 1, 1),
            FakeSource::ok("b", 1, 1),
            FakeSource::ok("c", 1, 1),
        ])
        .await;
        tokio::time::pause();
        let query = SearchQuery::new("q");

        let response = d
            .dispatch(
                &query,
                &SourceSelector::parse("c, a"),
                MergeOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(response.sources_searched, vec!["c", "a"]);
        assert_eq!(response.total_results, 2);
    }

    #[tokio::test]
    async fn test_unknown_source_rejected() {
        let d = dispatcher(vec![FakeSource::ok("a", 1, 1)]).await;
        tokio::time::pause();
        let query = SearchQuery::new("q");

        let err = d
            .dispatch(
                &query,
                &SourceSelector::parse("nope"),
                MergeOptions::default(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::UnknownSource(id) if id == "nope"));
    }

    #[tokio::test]
    async fn test_blank_selector_means_all() {
        let d = dispatcher(vec![FakeSource::ok("a", 1, 1), FakeSource::ok("b", 1, 1)]).await;
        tokio::time::pause();
        let query = SearchQuery::new("q");

        let response = d
            .dispatch(
                &query,
                &SourceSelector::parse("  "),
                MergeOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(response.sources_searched, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_sources_run_concurrently() {
        // Two sources sleeping 5s each finish in ~5s, not 10s.
        let d = dispatcher(vec![
            FakeSource::slow("a", Duration::from_secs(5)),
            FakeSource::slow("b", Duration::from_secs(5)),
        ])
        .await;
        tokio::time::pause();
        let query = SearchQuery::new("q");
        let started = Instant::now();

        let response = d
            .dispatch(&query, &SourceSelector::all(), MergeOptions::default())
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(6));
        assert_eq!(response.sources_searched.len(), 2);
    }

    #[tokio::test]
    async fn test_harvest_sources_snapshotted_per_request() {
        let db = Database::in_memory().await.unwrap();
        db.initialize().await.unwrap();
        let d = SearchDispatcher::new(db.clone(), Duration::from_secs(10))
            .register(FakeSource::ok("a", 1, 1));
        let repo = HarvestSourceRepository::new(db.clone());
        let query = SearchQuery::new("federated");

        // Before any harvest source exists, "all" is just the remotes.
        let response = d
            .dispatch(&query, &SourceSelector::all(), MergeOptions::default())
            .await
            .unwrap();
        assert_eq!(response.sources_searched, vec!["a"]);

        // A source activated after startup is visible to the next request.
        let source = repo.insert(&new_source("institutional-repo")).await.unwrap();
        MetadataRecordRepository::new(db)
            .upsert(&harvested_record("Federated search in practice"))
            .await
            .unwrap();

        let response = d
            .dispatch(&query, &SourceSelector::all(), MergeOptions::default())
            .await
            .unwrap();
        assert_eq!(
            response.sources_searched,
            vec!["a".to_string(), source.id.to_string()]
        );
        assert_eq!(response.total_results, 2);
    }

    #[tokio::test]
    async fn test_harvest_source_addressable_by_id() {
        let db = Database::in_memory().await.unwrap();
        db.initialize().await.unwrap();
        let d = SearchDispatcher::new(db.clone(), Duration::from_secs(10))
            .register(FakeSource::ok("a", 1, 1));
        let source = HarvestSourceRepository::new(db.clone())
            .insert(&new_source("institutional-repo"))
            .await
            .unwrap();
        MetadataRecordRepository::new(db)
            .upsert(&harvested_record("Federated search in practice"))
            .await
            .unwrap();

        let response = d
            .dispatch(
                &SearchQuery::new("federated"),
                &SourceSelector::parse(&source.id.to_string()),
                MergeOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(response.sources_searched, vec![source.id.to_string()]);
        assert_eq!(response.total_results, 1);
        assert_eq!(response.results[0].source, "institutional-repo");
    }

    #[tokio::test]
    async fn test_unknown_uuid_rejected() {
        let d = dispatcher(vec![FakeSource::ok("a", 1, 1)]).await;
        let missing = Uuid::new_v4().to_string();

        let err = d
            .dispatch(
                &SearchQuery::new("q"),
                &SourceSelector::parse(&missing),
                MergeOptions::default(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::UnknownSource(id) if id == missing));
    }
}
