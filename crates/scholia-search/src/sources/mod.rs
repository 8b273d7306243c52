//! Source adapters: one per external provider.
//!
//! Adapters own query translation, pagination translation, and response
//! normalization. Retry, backoff, and pacing belong to the transport;
//! adapters only classify what went wrong.

pub mod arxiv;
pub mod harvested;
pub mod pubmed;

use async_trait::async_trait;

use crate::models::{SearchQuery, SourcePage};
use scholia_common::SourceError;

/// Common interface for all search sources.
#[async_trait]
pub trait SearchSource: Send + Sync {
    /// Stable identifier used for selection and attribution.
    fn id(&self) -> &str;

    /// Runs one page of the query against this source and normalizes
    /// the native response.
    async fn search(&self, query: &SearchQuery) -> Result<SourcePage, SourceError>;
}
