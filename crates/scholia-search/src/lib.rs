//! scholia-search — federated literature search: canonical models,
//! resilient transport, per-provider source adapters, fan-out dispatch,
//! and result merging.

pub mod dispatch;
pub mod merge;
pub mod models;
pub mod sources;
pub mod transport;

pub use dispatch::{DispatchError, SearchDispatcher, SourceSelector};
pub use merge::MergeOptions;
pub use models::{
    Author, SearchFilters, SearchQuery, SearchResponse, SortOrder, SourceFailure, SourcePage,
    SourceResult,
};
pub use transport::{Pacer, RetryPolicy, Transport};
