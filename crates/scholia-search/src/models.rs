//! Canonical query and result shapes shared by all source adapters.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use scholia_common::{ErrorKind, SourceError};

/// One federated search request. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchQuery {
    pub term: String,
    #[serde(default)]
    pub filters: SearchFilters,
    /// 1-based page.
    pub page: u32,
    pub limit: u32,
}

impl SearchQuery {
    pub fn new(term: impl Into<String>) -> Self {
        Self {
            term: term.into(),
            filters: SearchFilters::default(),
            page: 1,
            limit: 20,
        }
    }

    /// 0-based offset for sources with offset pagination.
    pub fn offset(&self) -> u32 {
        self.page.saturating_sub(1) * self.limit
    }
}

/// Canonical filter set; each adapter maps these into its own grammar.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchFilters {
    #[serde(default)]
    pub date_from: Option<NaiveDate>,
    #[serde(default)]
    pub date_to: Option<NaiveDate>,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default)]
    pub journals: Vec<String>,
    #[serde(default)]
    pub article_types: Vec<String>,
    #[serde(default)]
    pub languages: Vec<String>,
}

impl SearchFilters {
    pub fn is_empty(&self) -> bool {
        self.date_from.is_none()
            && self.date_to.is_none()
            && self.authors.is_empty()
            && self.journals.is_empty()
            && self.article_types.is_empty()
            && self.languages.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affiliation: Option<String>,
}

/// One normalized bibliographic record from one source.
/// (id, source) is unique within a response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceResult {
    /// Source-scoped identifier (PMID, arXiv id, harvested record id).
    pub id: String,
    pub title: String,
    pub authors: Vec<Author>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abstract_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub journal: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doi: Option<String>,
    pub keywords: Vec<String>,
    /// Which source produced this record.
    pub source: String,
    /// Provider-specific metadata the canonical shape has no slot for.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// One page of adapter output, before merging.
#[derive(Debug, Clone, Default)]
pub struct SourcePage {
    pub results: Vec<SourceResult>,
    /// What the source reports as matching the query overall, which is
    /// independently authoritative and may exceed this page.
    pub total_results: u64,
}

/// A source that errored or timed out during fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceFailure {
    pub source: String,
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl SourceFailure {
    pub fn from_error(source: impl Into<String>, error: &SourceError) -> Self {
        Self {
            source: source.into(),
            kind: error.kind,
            message: error.message.clone(),
            retryable: error.retryable(),
        }
    }

    pub fn timeout(source: impl Into<String>, budget_secs: u64) -> Self {
        Self {
            source: source.into(),
            kind: ErrorKind::Timeout,
            message: format!("source exceeded the {budget_secs}s search budget"),
            retryable: true,
        }
    }
}

/// The merged, paginated response for one federated query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub results: Vec<SourceResult>,
    /// Sum of per-source totals; never deduplicated across sources.
    pub total_results: u64,
    pub page: u32,
    pub total_pages: u32,
    pub took_ms: u64,
    /// Sources that returned results, in dispatch order.
    pub sources_searched: Vec<String>,
    pub errors: Vec<SourceFailure>,
}

/// Output ordering of the merged result list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    /// Stable concatenation in dispatch order.
    #[default]
    Relevance,
    /// Publication date descending; missing dates sort oldest.
    DateDesc,
}

impl SortOrder {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "relevance" => Some(SortOrder::Relevance),
            "date" | "date_desc" => Some(SortOrder::DateDesc),
            _ => None,
        }
    }
}
