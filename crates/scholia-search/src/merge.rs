//! Merges per-source partial results into one paginated response.

use crate::models::{SearchQuery, SearchResponse, SortOrder, SourceFailure, SourcePage};

#[derive(Debug, Clone, Copy, Default)]
pub struct MergeOptions {
    pub sort: SortOrder,
    /// Drop later results sharing a DOI with an earlier one. Totals are
    /// never deduplicated; each source's count stays authoritative.
    pub dedup: bool,
}

/// Concatenates partials in dispatch order, optionally dedups and
/// re-sorts, truncates to the page limit, and computes totals.
pub fn merge(
    query: &SearchQuery,
    partials: Vec<(String, SourcePage)>,
    errors: Vec<SourceFailure>,
    took_ms: u64,
    options: MergeOptions,
) -> SearchResponse {
    let sources_searched: Vec<String> = partials.iter().map(|(name, _)| name.clone()).collect();
    let total_results: u64 = partials.iter().map(|(_, page)| page.total_results).sum();

    let mut results: Vec<_> = partials
        .into_iter()
        .flat_map(|(_, page)| page.results)
        .collect();

    if options.dedup {
        let mut seen = std::collections::HashSet::new();
        results.retain(|r| match &r.doi {
            Some(doi) => seen.insert(doi.to_lowercase()),
            None => true,
        });
    }

    if options.sort == SortOrder::DateDesc {
        // Stable: ties keep dispatch order; missing dates sort oldest.
        results.sort_by(|a, b| b.published.cmp(&a.published));
    }

    let limit = query.limit.max(1);
    results.truncate(limit as usize);

    let total_pages = total_results.div_ceil(u64::from(limit)) as u32;

    SearchResponse {
        results,
        total_results,
        page: query.page,
        total_pages,
        took_ms,
        sources_searched,
        errors,
    }
}
