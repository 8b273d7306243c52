//! Search adapter over the locally harvested metadata store.
//!
//! One adapter instance per harvest source, built fresh from the
//! source's current configuration at dispatch time. Queries hit SQLite
//! rather than the network, so this adapter skips the transport. All
//! filters run in the store's WHERE clause, so the reported total
//! matches what paging through would return.

use async_trait::async_trait;

use super::SearchSource;
use crate::models::{Author, SearchQuery, SourcePage, SourceResult};
use scholia_common::SourceError;
use scholia_db::{HarvestSource, MetadataRecord, MetadataRecordRepository, RecordFilter};

pub struct HarvestedSource {
    id: String,
    /// Display name stamped on results.
    label: String,
    providers: Vec<String>,
    records: MetadataRecordRepository,
}

impl HarvestedSource {
    /// `providers` restricts which harvested providers this source
    /// exposes; empty means all of them.
    pub fn new(
        id: impl Into<String>,
        label: impl Into<String>,
        providers: Vec<String>,
        records: MetadataRecordRepository,
    ) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            providers,
            records,
        }
    }

    /// Adapter for one configured harvest source, addressable by its id.
    pub fn for_source(source: &HarvestSource, records: MetadataRecordRepository) -> Self {
        Self::new(
            source.id.to_string(),
            source.name.clone(),
            source.providers.clone(),
            records,
        )
    }

    fn filter_for(&self, query: &SearchQuery) -> RecordFilter {
        RecordFilter {
            providers: self.providers.clone(),
            date_from: query.filters.date_from,
            date_to: query.filters.date_to,
            authors: query.filters.authors.clone(),
        }
    }
}

#[async_trait]
impl SearchSource for HarvestedSource {
    fn id(&self) -> &str {
        &self.id
    }

    async fn search(&self, query: &SearchQuery) -> Result<SourcePage, SourceError> {
        let filter = self.filter_for(query);
        let (records, total) = self
            .records
            .search(&query.term, &filter, query.page, query.limit)
            .await
            .map_err(|e| SourceError::unknown(format!("harvested store query failed: {e}")))?;

        let results: Vec<SourceResult> = records
            .into_iter()
            .map(|r| record_to_result(r, &self.label))
            .collect();

        Ok(SourcePage {
            results,
            total_results: total,
        })
    }
}

fn record_to_result(record: MetadataRecord, source: &str) -> SourceResult {
    SourceResult {
        id: record.record_id,
        title: record.title,
        authors: record
            .authors
            .into_iter()
            .map(|a| Author {
                name: a.name,
                affiliation: a.affiliation,
            })
            .collect(),
        abstract_text: record.abstract_text,
        published: record.published,
        journal: None,
        url: record.url,
        doi: record.doi,
        keywords: record.keywords,
        source: source.to_string(),
        extra: {
            let mut extra = serde_json::Map::new();
            extra.insert(
                "provider".to_string(),
                serde_json::Value::String(record.provider),
            );
            extra
        },
    }
}
