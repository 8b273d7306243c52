//! arXiv API client.
//!
//! Single-request Atom protocol: the query goes out as a `search_query`
//! expression, the feed comes back as Atom XML with an
//! `opensearch:totalResults` element carrying the overall count.

use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::Client;
use tracing::{debug, instrument};

use super::SearchSource;
use crate::models::{Author, SearchQuery, SourcePage, SourceResult};
use crate::transport::Transport;
use scholia_common::{parse_retry_after, SourceError};

const ARXIV_BASE: &str = "https://export.arxiv.org/api/query";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ArxivSource {
    client: Client,
    transport: Transport,
    base_url: String,
}

impl ArxivSource {
    pub fn new(transport: Transport) -> Self {
        Self {
            client: Client::new(),
            transport,
            base_url: ARXIV_BASE.to_string(),
        }
    }

    /// Point the adapter at a different API host (tests).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Map the canonical query + filters into arXiv search_query grammar.
    ///
    /// Article types map onto category prefixes (`cat:`) and pass through
    /// verbatim; language filters have no arXiv facet and are ignored.
    fn build_search_query(query: &SearchQuery) -> String {
        let mut parts = vec![format!("all:\"{}\"", query.term)];
        let filters = &query.filters;

        for author in &filters.authors {
            parts.push(format!("au:\"{author}\""));
        }
        for journal in &filters.journals {
            parts.push(format!("jr:\"{journal}\""));
        }
        for article_type in &filters.article_types {
            parts.push(format!("cat:{article_type}"));
        }
        if filters.date_from.is_some() || filters.date_to.is_some() {
            let from = filters
                .date_from
                .map(|d| d.format("%Y%m%d0000").to_string())
                .unwrap_or_else(|| "190001010000".to_string());
            let to = filters
                .date_to
                .map(|d| d.format("%Y%m%d2359").to_string())
                .unwrap_or_else(|| "999912312359".to_string());
            parts.push(format!("submittedDate:[{from} TO {to}]"));
        }

        parts.join(" AND ")
    }

    #[instrument(skip(self, query), fields(page = query.page, limit = query.limit))]
    async fn fetch_feed(&self, query: &SearchQuery) -> Result<String, SourceError> {
        let params = [
            ("search_query", Self::build_search_query(query)),
            ("start", query.offset().to_string()),
            ("max_results", query.limit.to_string()),
        ];

        self.transport
            .execute(|| async {
                let response = self
                    .client
                    .get(&self.base_url)
                    .query(&params)
                    .timeout(REQUEST_TIMEOUT)
                    .send()
                    .await
                    .map_err(SourceError::from)?;

                let status = response.status();
                if !status.is_success() {
                    let retry_after = response
                        .headers()
                        .get(reqwest::header::RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(parse_retry_after);
                    return Err(SourceError::from_status(status, retry_after));
                }

                response.text().await.map_err(SourceError::from)
            })
            .await
    }
}

#[async_trait]
impl SearchSource for ArxivSource {
    fn id(&self) -> &str {
        "arxiv"
    }

    async fn search(&self, query: &SearchQuery) -> Result<SourcePage, SourceError> {
        let feed = self.fetch_feed(query).await?;
        let page = parse_atom_feed(&feed)?;
        debug!(
            results = page.results.len(),
            total = page.total_results,
            "arxiv feed parsed"
        );
        Ok(page)
    }
}

#[derive(Default)]
struct EntryBuilder {
    id: String,
    title: String,
    summary: String,
    published: Option<NaiveDate>,
    authors: Vec<Author>,
    keywords: Vec<String>,
    doi: Option<String>,
    url: Option<String>,
    journal: Option<String>,
}

impl EntryBuilder {
    fn build(self) -> SourceResult {
        let url = self
            .url
            .or_else(|| Some(format!("https://arxiv.org/abs/{}", self.id)));
        SourceResult {
            id: self.id,
            title: normalize_whitespace(&self.title),
            authors: self.authors,
            abstract_text: if self.summary.is_empty() {
                None
            } else {
                Some(normalize_whitespace(&self.summary))
            },
            published: self.published,
            journal: self.journal,
            url,
            doi: self.doi,
            keywords: self.keywords,
            source: "arxiv".to_string(),
            extra: serde_json::Map::new(),
        }
    }
}

/// Atom titles and summaries arrive with feed line wrapping.
fn normalize_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// The versionless arXiv id is everything after "/abs/".
fn id_from_atom_id(atom_id: &str) -> String {
    atom_id
        .rsplit_once("/abs/")
        .map(|(_, id)| id.to_string())
        .unwrap_or_else(|| atom_id.to_string())
}

/// Tag names arrive namespace-prefixed; match on the local part.
fn local_name(name: &[u8]) -> &[u8] {
    match name.iter().rposition(|&b| b == b':') {
        Some(pos) => &name[pos + 1..],
        None => name,
    }
}

/// Parse an arXiv Atom feed into a normalized result page.
fn parse_atom_feed(xml: &str) -> Result<SourcePage, SourceError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut results = Vec::new();
    let mut total_results = 0u64;
    let mut entry: Option<EntryBuilder> = None;
    let mut in_author = false;
    let mut text_target: Option<Target> = None;
    let mut buf = Vec::new();

    #[derive(PartialEq)]
    enum Target {
        Id,
        Title,
        Summary,
        Published,
        AuthorName,
        Doi,
        JournalRef,
        TotalResults,
    }

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                let name = e.name();
                match local_name(name.as_ref()) {
                    b"entry" => entry = Some(EntryBuilder::default()),
                    b"author" if entry.is_some() => in_author = true,
                    b"name" if in_author => text_target = Some(Target::AuthorName),
                    b"id" if entry.is_some() => text_target = Some(Target::Id),
                    b"title" if entry.is_some() => text_target = Some(Target::Title),
                    b"summary" if entry.is_some() => text_target = Some(Target::Summary),
                    b"published" if entry.is_some() => text_target = Some(Target::Published),
                    b"doi" if entry.is_some() => text_target = Some(Target::Doi),
                    b"journal_ref" if entry.is_some() => text_target = Some(Target::JournalRef),
                    b"totalResults" => text_target = Some(Target::TotalResults),
                    _ => {}
                }
            }
            Ok(Event::Empty(ref e)) => {
                let name = e.name();
                if let Some(builder) = entry.as_mut() {
                    match local_name(name.as_ref()) {
                        // <category term="cs.LG"/>
                        b"category" => {
                            if let Some(term) = attr_value(e, b"term") {
                                builder.keywords.push(term);
                            }
                        }
                        // <link title="doi" href=.../> or the abstract page link
                        b"link" => {
                            let title = attr_value(e, b"title");
                            let href = attr_value(e, b"href");
                            match (title.as_deref(), href) {
                                (Some("doi"), Some(href)) => {
                                    if builder.doi.is_none() {
                                        builder.doi = Some(
                                            href.trim_start_matches("https://doi.org/")
                                                .trim_start_matches("http://dx.doi.org/")
                                                .to_string(),
                                        );
                                    }
                                }
                                (None, Some(href)) => {
                                    let is_alternate = e
                                        .attributes()
                                        .flatten()
                                        .any(|a| {
                                            a.key.as_ref() == b"rel"
                                                && a.value.as_ref() == b"alternate"
                                        });
                                    if is_alternate {
                                        builder.url = Some(href);
                                    }
                                }
                                _ => {}
                            }
                        }
                        _ => {}
                    }
                }
            }
            Ok(Event::Text(ref e)) => {
                let text = e.unescape().unwrap_or_default();
                match text_target {
                    Some(Target::TotalResults) => {
                        total_results = text.trim().parse().unwrap_or(0);
                    }
                    Some(ref target) => {
                        if let Some(builder) = entry.as_mut() {
                            match target {
                                Target::Id => builder.id = id_from_atom_id(text.trim()),
                                Target::Title => builder.title.push_str(&text),
                                Target::Summary => builder.summary.push_str(&text),
                                Target::Published => {
                                    // "2024-03-15T17:59:59Z": the date prefix is enough
                                    builder.published = text
                                        .get(..10)
                                        .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok());
                                }
                                Target::AuthorName => builder.authors.push(Author {
                                    name: text.trim().to_string(),
                                    affiliation: None,
                                }),
                                Target::Doi => builder.doi = Some(text.trim().to_string()),
                                Target::JournalRef => {
                                    builder.journal = Some(normalize_whitespace(&text))
                                }
                                Target::TotalResults => unreachable!(),
                            }
                        }
                    }
                    None => {}
                }
            }
            Ok(Event::End(ref e)) => {
                let name = e.name();
                match local_name(name.as_ref()) {
                    b"entry" => {
                        if let Some(builder) = entry.take() {
                            results.push(builder.build());
                        }
                    }
                    b"author" => in_author = false,
                    _ => text_target = None,
                }
                if matches!(local_name(name.as_ref()), b"entry" | b"author") {
                    text_target = None;
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(SourceError::parse(format!("atom feed: {e}")));
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(SourcePage {
        results,
        total_results,
    })
}

fn attr_value(e: &quick_xml::events::BytesStart<'_>, key: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.as_ref() == key)
        .and_then(|a| a.unescape_value().ok().map(|v| v.to_string()))
}
