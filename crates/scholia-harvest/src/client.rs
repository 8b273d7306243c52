//! Client for cursor-paginated metadata repositories speaking the
//! OAI-PMH ListRecords protocol with Dublin Core payloads.
//!
//! One call fetches one page. Pagination state lives entirely in the
//! provider-issued resumption token; the caller persists it between
//! pages.

use std::time::Duration;

use chrono::{NaiveDate, Utc};
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::Client;
use thiserror::Error;
use tracing::{debug, instrument};

use scholia_common::{parse_retry_after, SourceError};
use scholia_db::{HarvestSource, MetadataRecord, RecordAuthor};
use scholia_search::Transport;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ClientError {
    /// The provider no longer honors the saved cursor; the harvest must
    /// restart from the beginning.
    #[error("provider rejected the resumption cursor")]
    BadCursor,
    #[error(transparent)]
    Source(#[from] SourceError),
}

/// One page of harvested records plus the cursor for the next page.
/// A `None` cursor means the list is exhausted.
#[derive(Debug, Default)]
pub struct HarvestPage {
    pub records: Vec<MetadataRecord>,
    pub cursor: Option<String>,
    /// Provider-reported size of the full list, when given.
    pub complete_list_size: Option<u64>,
    /// Records the provider marked deleted; skipped, not stored.
    pub skipped_deleted: u64,
}

pub struct HarvestClient {
    client: Client,
    transport: Transport,
}

impl HarvestClient {
    pub fn new(transport: Transport) -> Self {
        Self {
            client: Client::new(),
            transport,
        }
    }

    /// Fetches one page. With a cursor, the request carries only the
    /// token; format and set ride only on the first request.
    #[instrument(skip(self, source), fields(source = %source.name))]
    pub async fn fetch_page(
        &self,
        source: &HarvestSource,
        cursor: Option<&str>,
    ) -> Result<HarvestPage, ClientError> {
        let mut params = vec![("verb", "ListRecords".to_string())];
        match cursor {
            Some(token) => params.push(("resumptionToken", token.to_string())),
            None => {
                params.push(("metadataPrefix", source.metadata_format.clone()));
                if let Some(set) = &source.set_spec {
                    params.push(("set", set.clone()));
                }
            }
        }

        let body = self
            .transport
            .execute(|| async {
                let response = self
                    .client
                    .get(&source.endpoint_url)
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
            .await?;

        let page = parse_list_records(&body, &source.name)?;
        debug!(
            records = page.records.len(),
            skipped_deleted = page.skipped_deleted,
            has_cursor = page.cursor.is_some(),
            "harvested page"
        );
        Ok(page)
    }
}

#[derive(Default)]
struct RecordBuilder {
    identifier: String,
    deleted: bool,
    title: String,
    creators: Vec<String>,
    description: String,
    date: Option<String>,
    identifiers: Vec<String>,
    subjects: Vec<String>,
}

impl RecordBuilder {
    fn build(self, provider: &str) -> MetadataRecord {
        let doi = self.identifiers.iter().find_map(|id| extract_doi(id));
        let url = self
            .identifiers
            .iter()
            .find(|id| id.starts_with("http://") || id.starts_with("https://"))
            .cloned();

        MetadataRecord {
            provider: provider.to_string(),
            record_id: self.identifier,
            title: self.title.trim().to_string(),
            authors: self
                .creators
                .into_iter()
                .map(|name| RecordAuthor {
                    name,
                    affiliation: None,
                })
                .collect(),
            abstract_text: if self.description.trim().is_empty() {
                None
            } else {
                Some(self.description.trim().to_string())
            },
            published: self.date.as_deref().and_then(parse_dc_date),
            doi,
            url,
            keywords: self.subjects,
            harvested_at: Utc::now(),
        }
    }
}

/// Dublin Core dates arrive as "2024-03-15", "2024-03", or "2024".
fn parse_dc_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(date);
    }
    if let Ok(date) = NaiveDate::parse_from_str(&format!("{raw}-01"), "%Y-%m-%d") {
        return Some(date);
    }
    raw.parse::<i32>()
        .ok()
        .and_then(|year| NaiveDate::from_ymd_opt(year, 1, 1))
}

/// DOIs hide in dc:identifier as bare "10.x/y" values or doi.org URLs.
fn extract_doi(identifier: &str) -> Option<String> {
    let identifier = identifier.trim();
    if identifier.starts_with("10.") {
        return Some(identifier.to_string());
    }
    for prefix in ["https://doi.org/", "http://doi.org/", "http://dx.doi.org/", "doi:"] {
        if let Some(rest) = identifier.strip_prefix(prefix) {
            return Some(rest.to_string());
        }
    }
    None
}

/// Tag names arrive namespace-prefixed; match on the local part.
fn local_name(name: &[u8]) -> &[u8] {
    match name.iter().rposition(|&b| b == b':') {
        Some(pos) => &name[pos + 1..],
        None => name,
    }
}

/// Parse a ListRecords response into normalized records.
///
/// A `noRecordsMatch` error element yields an empty, exhausted page;
/// `badResumptionToken` becomes `ClientError::BadCursor`; other error
/// codes surface as permanent rejections.
fn parse_list_records(xml: &str, provider: &str) -> Result<HarvestPage, ClientError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut page = HarvestPage::default();
    let mut record: Option<RecordBuilder> = None;
    let mut in_header = false;
    let mut in_metadata = false;
    let mut error_code: Option<String> = None;
    let mut in_error = false;
    let mut error_text = String::new();
    let mut text_target: Option<Target> = None;
    let mut buf = Vec::new();

    enum Target {
        Identifier,
        Title,
        Creator,
        Description,
        Date,
        DcIdentifier,
        Subject,
        ResumptionToken,
    }

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                let name = e.name();
                match local_name(name.as_ref()) {
                    b"error" => {
                        in_error = true;
                        error_code = attr_value(e, b"code");
                    }
                    b"record" => record = Some(RecordBuilder::default()),
                    b"header" => {
                        in_header = true;
                        if let (Some(builder), Some(status)) =
                            (record.as_mut(), attr_value(e, b"status"))
                        {
                            builder.deleted = status == "deleted";
                        }
                    }
                    b"metadata" => in_metadata = true,
                    b"identifier" if in_header => text_target = Some(Target::Identifier),
                    b"title" if in_metadata => text_target = Some(Target::Title),
                    b"creator" if in_metadata => text_target = Some(Target::Creator),
                    b"description" if in_metadata => text_target = Some(Target::Description),
                    b"date" if in_metadata => text_target = Some(Target::Date),
                    b"identifier" if in_metadata => text_target = Some(Target::DcIdentifier),
                    b"subject" if in_metadata => text_target = Some(Target::Subject),
                    b"resumptionToken" => {
                        text_target = Some(Target::ResumptionToken);
                        page.complete_list_size = attr_value(e, b"completeListSize")
                            .and_then(|v| v.parse().ok());
                    }
                    _ => {}
                }
            }
            Ok(Event::Text(ref e)) => {
                let text = e.unescape().unwrap_or_default();
                if in_error {
                    error_text.push_str(&text);
                }
                match (text_target.as_ref(), record.as_mut()) {
                    (Some(Target::ResumptionToken), _) => {
                        let token = text.trim();
                        if !token.is_empty() {
                            page.cursor = Some(token.to_string());
                        }
                    }
                    (Some(target), Some(builder)) => match target {
                        Target::Identifier => builder.identifier = text.trim().to_string(),
                        Target::Title => builder.title.push_str(&text),
                        Target::Creator => builder.creators.push(text.trim().to_string()),
                        Target::Description => builder.description.push_str(&text),
                        Target::Date => builder.date = Some(text.trim().to_string()),
                        Target::DcIdentifier => builder.identifiers.push(text.trim().to_string()),
                        Target::Subject => builder.subjects.push(text.trim().to_string()),
                        Target::ResumptionToken => {}
                    },
                    _ => {}
                }
            }
            Ok(Event::End(ref e)) => {
                let name = e.name();
                match local_name(name.as_ref()) {
                    b"error" => in_error = false,
                    b"record" => {
                        if let Some(builder) = record.take() {
                            if builder.deleted {
                                page.skipped_deleted += 1;
                            } else if !builder.identifier.is_empty() {
                                page.records.push(builder.build(provider));
                            }
                        }
                    }
                    b"header" => in_header = false,
                    b"metadata" => in_metadata = false,
                    _ => {}
                }
                text_target = None;
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(SourceError::parse(format!("ListRecords XML: {e}")).into());
            }
            _ => {}
        }
        buf.clear();
    }

    if let Some(code) = error_code {
        return match code.as_str() {
            "noRecordsMatch" => Ok(HarvestPage::default()),
            "badResumptionToken" => Err(ClientError::BadCursor),
            other => Err(SourceError::rejected(format!(
                "provider error {other}: {}",
                error_text.trim()
            ))
            .into()),
        };
    }

    Ok(page)
}

fn attr_value(e: &quick_xml::events::BytesStart<'_>, key: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.as_ref() == key)
        .and_then(|a| a.unescape_value().ok().map(|v| v.to_string()))
}
