//! PubMed E-utilities client.
//!
//! Three-step protocol:
//!   esearch:  term -> PMID list + total count
//!   esummary: PMIDs -> titles, authors, journal, dates (no abstracts)
//!   efetch:   PMIDs -> abstract XML, only for ids esummary left bare

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use super::SearchSource;
use crate::models::{Author, SearchQuery, SourcePage, SourceResult};
use crate::transport::Transport;
use scholia_common::config::PubMedConfig;
use scholia_common::{parse_retry_after, SourceError};

const EUTILS_BASE: &str = "https://eutils.ncbi.nlm.nih.gov/entrez/eutils";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Canonical article-type values mapped into PubMed's publication-type
/// taxonomy. Unmapped values pass through verbatim.
const ARTICLE_TYPE_MAP: &[(&str, &str)] = &[
    ("clinical_trial", "Clinical Trial"),
    ("randomized_controlled_trial", "Randomized Controlled Trial"),
    ("review", "Review"),
    ("systematic_review", "Systematic Review"),
    ("meta_analysis", "Meta-Analysis"),
    ("case_report", "Case Reports"),
    ("editorial", "Editorial"),
    ("letter", "Letter"),
];

/// Canonical language codes mapped into PubMed's controlled vocabulary.
/// Unmapped values pass through verbatim.
const LANGUAGE_MAP: &[(&str, &str)] = &[
    ("en", "english"),
    ("eng", "english"),
    ("fr", "french"),
    ("de", "german"),
    ("es", "spanish"),
    ("it", "italian"),
    ("pt", "portuguese"),
    ("zh", "chinese"),
    ("ja", "japanese"),
    ("ru", "russian"),
];

pub struct PubMedSource {
    client: Client,
    transport: Transport,
    api_key: Option<String>,
    base_url: String,
}

impl PubMedSource {
    pub fn new(config: &PubMedConfig, transport: Transport) -> Self {
        Self {
            client: Client::new(),
            transport,
            api_key: config.api_key.clone(),
            base_url: EUTILS_BASE.to_string(),
        }
    }

    /// Point the adapter at a different E-utilities host (tests).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Map the canonical query + filters into PubMed term grammar.
    fn build_term(query: &SearchQuery) -> String {
        let mut term = query.term.clone();
        let filters = &query.filters;

        for author in &filters.authors {
            term.push_str(&format!(" AND {author}[Author]"));
        }
        for journal in &filters.journals {
            term.push_str(&format!(" AND \"{journal}\"[Journal]"));
        }
        for article_type in &filters.article_types {
            let mapped = lookup(ARTICLE_TYPE_MAP, article_type).unwrap_or(article_type);
            term.push_str(&format!(" AND \"{mapped}\"[Publication Type]"));
        }
        for language in &filters.languages {
            let mapped = lookup(LANGUAGE_MAP, language).unwrap_or(language);
            term.push_str(&format!(" AND {mapped}[Language]"));
        }
        term
    }

    fn base_params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![("db", "pubmed".to_string()), ("retmode", "json".to_string())];
        if let Some(key) = &self.api_key {
            params.push(("api_key", key.clone()));
        }
        params
    }

    /// One transported GET returning the body as text.
    async fn get_text(&self, url: &str, params: &[(&str, String)]) -> Result<String, SourceError> {
        self.transport
            .execute(|| async {
                let response = self
                    .client
                    .get(url)
                    .query(params)
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

    async fn get_json(&self, url: &str, params: &[(&str, String)]) -> Result<Value, SourceError> {
        let body = self.get_text(url, params).await?;
        serde_json::from_str(&body)
            .map_err(|e| SourceError::parse(format!("invalid esearch/esummary JSON: {e}")))
    }

    /// Step 1: resolve the query to PMIDs and the authoritative count.
    #[instrument(skip(self, query), fields(page = query.page, limit = query.limit))]
    async fn esearch(&self, query: &SearchQuery) -> Result<(Vec<String>, u64), SourceError> {
        let mut params = self.base_params();
        params.push(("term", Self::build_term(query)));
        params.push(("retstart", query.offset().to_string()));
        params.push(("retmax", query.limit.to_string()));
        params.push(("usehistory", "n".to_string()));
        if let Some(from) = query.filters.date_from {
            params.push(("mindate", from.format("%Y/%m/%d").to_string()));
            params.push(("datetype", "pdat".to_string()));
        }
        if let Some(to) = query.filters.date_to {
            params.push(("maxdate", to.format("%Y/%m/%d").to_string()));
            if query.filters.date_from.is_none() {
                params.push(("datetype", "pdat".to_string()));
            }
        }

        let url = format!("{}/esearch.fcgi", self.base_url);
        let resp = self.get_json(&url, &params).await?;

        let result = &resp["esearchresult"];
        if result.is_null() {
            return Err(SourceError::parse("esearch response missing esearchresult"));
        }
        let total = result["count"]
            .as_str()
            .and_then(|c| c.parse::<u64>().ok())
            .unwrap_or(0);
        let ids: Vec<String> = result["idlist"]
            .as_array()
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();

        debug!(total, ids = ids.len(), "esearch resolved PMIDs");
        Ok((ids, total))
    }

    /// Step 2: fetch document summaries for the PMIDs.
    #[instrument(skip(self))]
    async fn esummary(&self, pmids: &[String]) -> Result<Vec<SourceResult>, SourceError> {
        if pmids.is_empty() {
            return Ok(vec![]);
        }

        let mut params = self.base_params();
        params.push(("id", pmids.join(",")));
        let url = format!("{}/esummary.fcgi", self.base_url);
        let resp = self.get_json(&url, &params).await?;

        let result = &resp["result"];
        if result.is_null() {
            return Err(SourceError::parse("esummary response missing result"));
        }

        let mut results = Vec::with_capacity(pmids.len());
        for pmid in pmids {
            let doc = &result[pmid.as_str()];
            if doc.is_null() {
                warn!(pmid, "esummary omitted a requested PMID");
                continue;
            }
            results.push(summary_to_result(pmid, doc));
        }
        Ok(results)
    }

    /// Step 3: abstracts are absent from esummary; fetch them for the
    /// ids that still lack one.
    #[instrument(skip(self))]
    async fn efetch_abstracts(
        &self,
        pmids: &[String],
    ) -> Result<HashMap<String, String>, SourceError> {
        if pmids.is_empty() {
            return Ok(HashMap::new());
        }

        let mut params = vec![
            ("db", "pubmed".to_string()),
            ("id", pmids.join(",")),
            ("rettype", "abstract".to_string()),
            ("retmode", "xml".to_string()),
        ];
        if let Some(key) = &self.api_key {
            params.push(("api_key", key.clone()));
        }

        let url = format!("{}/efetch.fcgi", self.base_url);
        let xml = self.get_text(&url, &params).await?;
        parse_abstract_xml(&xml)
    }
}

#[async_trait]
impl SearchSource for PubMedSource {
    fn id(&self) -> &str {
        "pubmed"
    }

    async fn search(&self, query: &SearchQuery) -> Result<SourcePage, SourceError> {
        let (pmids, total) = self.esearch(query).await?;
        let mut results = self.esummary(&pmids).await?;

        let missing: Vec<String> = results
            .iter()
            .filter(|r| r.abstract_text.is_none())
            .map(|r| r.id.clone())
            .collect();
        if !missing.is_empty() {
            let abstracts = self.efetch_abstracts(&missing).await?;
            for result in &mut results {
                if result.abstract_text.is_none() {
                    result.abstract_text = abstracts.get(&result.id).cloned();
                }
            }
        }

        Ok(SourcePage {
            results,
            total_results: total,
        })
    }
}

fn lookup<'a>(table: &[(&str, &'a str)], key: &str) -> Option<&'a str> {
    table
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| *v)
}

fn summary_to_result(pmid: &str, doc: &Value) -> SourceResult {
    let authors = doc["authors"]
        .as_array()
        .map(|a| {
            a.iter()
                .filter_map(|author| author["name"].as_str())
                .map(|name| Author {
                    name: name.to_string(),
                    affiliation: None,
                })
                .collect()
        })
        .unwrap_or_default();

    let doi = doc["articleids"]
        .as_array()
        .and_then(|ids| {
            ids.iter()
                .find(|id| id["idtype"].as_str() == Some("doi"))
                .and_then(|id| id["value"].as_str())
        })
        .map(String::from);

    let pubdate_raw = doc["pubdate"].as_str().unwrap_or_default();

    let mut extra = serde_json::Map::new();
    if !pubdate_raw.is_empty() {
        extra.insert("pubdate".to_string(), Value::String(pubdate_raw.to_string()));
    }
    if let Some(volume) = doc["volume"].as_str().filter(|v| !v.is_empty()) {
        extra.insert("volume".to_string(), Value::String(volume.to_string()));
    }

    SourceResult {
        id: pmid.to_string(),
        title: doc["title"].as_str().unwrap_or_default().to_string(),
        authors,
        abstract_text: None,
        published: parse_pubdate(pubdate_raw),
        journal: doc["fulljournalname"].as_str().map(String::from),
        url: Some(format!("https://pubmed.ncbi.nlm.nih.gov/{pmid}/")),
        doi,
        keywords: vec![],
        source: "pubmed".to_string(),
        extra,
    }
}

/// PubMed pubdate strings come in "2024 Mar 15", "2024 Mar", and "2024"
/// shapes; missing parts default to the first day/month.
fn parse_pubdate(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y %b %d") {
        return Some(date);
    }
    if let Ok(date) = NaiveDate::parse_from_str(&format!("{raw} 1"), "%Y %b %d") {
        return Some(date);
    }
    raw.split_whitespace()
        .next()
        .and_then(|year| year.parse::<i32>().ok())
        .and_then(|year| NaiveDate::from_ymd_opt(year, 1, 1))
}

/// Parse efetch abstract XML into PMID -> abstract text.
/// Handles the <PubmedArticleSet><PubmedArticle> structure; multiple
/// <AbstractText> sections are joined.
fn parse_abstract_xml(xml: &str) -> Result<HashMap<String, String>, SourceError> {
    let mut abstracts = HashMap::new();
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut current_pmid: Option<String> = None;
    let mut current_text = String::new();
    let mut in_pmid = false;
    let mut in_abstract = false;
    let mut pmid_seen = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => match e.name().as_ref() {
                b"PubmedArticle" => {
                    current_pmid = None;
                    current_text.clear();
                    pmid_seen = false;
                }
                // Only the citation-level PMID; references repeat the tag
                b"PMID" if !pmid_seen => in_pmid = true,
                b"AbstractText" => in_abstract = true,
                _ => {}
            },
            Ok(Event::Text(ref e)) => {
                let text = e.unescape().unwrap_or_default();
                if in_pmid {
                    current_pmid = Some(text.to_string());
                }
                if in_abstract {
                    if !current_text.is_empty() {
                        current_text.push(' ');
                    }
                    current_text.push_str(&text);
                }
            }
            Ok(Event::End(ref e)) => match e.name().as_ref() {
                b"PMID" => {
                    if in_pmid {
                        in_pmid = false;
                        pmid_seen = true;
                    }
                }
                b"AbstractText" => in_abstract = false,
                b"PubmedArticle" => {
                    if let Some(pmid) = current_pmid.take() {
                        if !current_text.is_empty() {
                            abstracts.insert(pmid, std::mem::take(&mut current_text));
                        }
                    }
                    current_text.clear();
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(SourceError::parse(format!("efetch XML: {e}")));
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(abstracts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SearchFilters;

    fn query_with(filters: SearchFilters) -> SearchQuery {
        let mut query = SearchQuery::new("kras g12d");
        query.filters = filters;
        query
    }

    #[test]
    fn test_build_term_plain() {
        let term = PubMedSource::build_term(&SearchQuery::new("kras g12d"));
        assert_eq!(term, "kras g12d");
    }

    #[test]
    fn test_build_term_maps_article_types_and_languages() {
        let term = PubMedSource::build_term(&query_with(SearchFilters {
            article_types: vec!["meta_analysis".to_string()],
            languages: vec!["en".to_string()],
            ..Default::default()
        }));
        assert_eq!(
            term,
            "kras g12d AND \"Meta-Analysis\"[Publication Type] AND english[Language]"
        );
    }

    #[test]
    fn test_build_term_unmapped_values_pass_through() {
        let term = PubMedSource::build_term(&query_with(SearchFilters {
            article_types: vec!["Dataset".to_string()],
            languages: vec!["klingon".to_string()],
            ..Default::default()
        }));
        assert!(term.contains("\"Dataset\"[Publication Type]"));
        assert!(term.contains("klingon[Language]"));
    }

    #[test]
    fn test_build_term_authors_and_journals() {
        let term = PubMedSource::build_term(&query_with(SearchFilters {
            authors: vec!["Smith J".to_string()],
            journals: vec!["Nature".to_string()],
            ..Default::default()
        }));
        assert_eq!(term, "kras g12d AND Smith J[Author] AND \"Nature\"[Journal]");
    }

    #[test]
    fn test_parse_pubdate_variants() {
        assert_eq!(
            parse_pubdate("2024 Mar 15"),
            NaiveDate::from_ymd_opt(2024, 3, 15)
        );
        assert_eq!(
            parse_pubdate("2024 Mar"),
            NaiveDate::from_ymd_opt(2024, 3, 1)
        );
        assert_eq!(parse_pubdate("2024"), NaiveDate::from_ymd_opt(2024, 1, 1));
        assert_eq!(parse_pubdate(""), None);
        assert_eq!(parse_pubdate("Winter"), None);
    }

    #[test]
    fn test_summary_to_result_extracts_doi() {
        let doc: Value = serde_json::from_str(
            r#"{
                "title": "KRAS G12D in pancreatic cancer",
                "pubdate": "2023 Jun 2",
                "fulljournalname": "Nature",
                "authors": [{"name": "Smith J"}, {"name": "Doe A"}],
                "articleids": [
                    {"idtype": "pubmed", "value": "12345678"},
                    {"idtype": "doi", "value": "10.1038/xyz"}
                ]
            }"#,
        )
        .unwrap();

        let result = summary_to_result("12345678", &doc);
        assert_eq!(result.id, "12345678");
        assert_eq!(result.doi.as_deref(), Some("10.1038/xyz"));
        assert_eq!(result.authors.len(), 2);
        assert_eq!(result.journal.as_deref(), Some("Nature"));
        assert_eq!(result.published, NaiveDate::from_ymd_opt(2023, 6, 2));
        assert_eq!(result.source, "pubmed");
    }

    #[test]
    fn test_parse_abstract_xml() {
        let xml = r#"<?xml version="1.0"?>
<PubmedArticleSet>
  <PubmedArticle>
    <MedlineCitation>
      <PMID>11111111</PMID>
      <Article>
        <Abstract>
          <AbstractText>First part.</AbstractText>
          <AbstractText>Second part.</AbstractText>
        </Abstract>
      </Article>
    </MedlineCitation>
  </PubmedArticle>
  <PubmedArticle>
    <MedlineCitation>
      <PMID>22222222</PMID>
      <Article></Article>
    </MedlineCitation>
  </PubmedArticle>
</PubmedArticleSet>"#;

        let abstracts = parse_abstract_xml(xml).unwrap();
        assert_eq!(
            abstracts.get("11111111").map(String::as_str),
            Some("First part. Second part.")
        );
        assert!(!abstracts.contains_key("22222222"));
    }
}
