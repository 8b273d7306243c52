//! Federated search endpoint.

use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;

use scholia_common::ApiError;
use scholia_search::dispatch::DispatchError;
use scholia_search::{MergeOptions, SearchFilters, SearchQuery, SearchResponse, SortOrder, SourceSelector};

use crate::state::SharedState;

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    pub q: Option<String>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
    /// "all" (default), a remote provider id, a harvest source uuid, or
    /// a comma-separated mix.
    pub source: Option<String>,
    /// "relevance" (default) or "date".
    pub sort: Option<String>,
    #[serde(default)]
    pub dedup: bool,
    /// URL-encoded JSON object of canonical filters.
    pub filters: Option<String>,
}

/// GET /search — fan the query out and merge whatever survives.
///
/// Partial upstream failure is still a 200; the failed sources are
/// listed in `errors`. Only invalid input is a 4xx.
pub async fn search(
    State(state): State<SharedState>,
    Query(params): Query<SearchParams>,
) -> Result<impl IntoResponse, ApiError> {
    let term = params
        .q
        .as_deref()
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .ok_or_else(|| ApiError::BadRequest("missing required parameter: q".to_string()))?;

    let search_config = &state.config.search;
    let mut query = SearchQuery::new(term);
    query.page = params.page.unwrap_or(1).max(1);
    query.limit = params
        .limit
        .unwrap_or(search_config.default_limit)
        .clamp(1, search_config.max_limit);

    if let Some(raw) = params.filters.as_deref().filter(|f| !f.trim().is_empty()) {
        query.filters = serde_json::from_str::<SearchFilters>(raw)
            .map_err(|e| ApiError::BadRequest(format!("invalid filters: {e}")))?;
    }

    let sort = match params.sort.as_deref() {
        None => SortOrder::default(),
        Some(raw) => SortOrder::parse(raw)
            .ok_or_else(|| ApiError::BadRequest(format!("invalid sort: {raw}")))?,
    };
    let options = MergeOptions {
        sort,
        dedup: params.dedup,
    };

    let selector = match params.source.as_deref() {
        None => SourceSelector::all(),
        Some(raw) => SourceSelector::parse(raw),
    };

    match state.dispatcher.dispatch(&query, &selector, options).await {
        Ok(response) => Ok(Json(response)),
        // Every source failed: still a 200, with the failures attached
        Err(DispatchError::AllSourcesFailed(errors)) => Ok(Json(SearchResponse {
            results: vec![],
            total_results: 0,
            page: query.page,
            total_pages: 0,
            took_ms: 0,
            sources_searched: vec![],
            errors,
        })),
        Err(e @ DispatchError::UnknownSource(_)) => Err(ApiError::BadRequest(e.to_string())),
        Err(e @ DispatchError::NoSources) => Err(ApiError::BadRequest(e.to_string())),
        Err(DispatchError::Db(e)) => Err(ApiError::Internal(e.to_string())),
    }
}
