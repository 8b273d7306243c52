//! Row types for the harvest and metadata tables.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a configured harvest source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HarvestStatus {
    Active,
    Inactive,
    Harvesting,
    Error,
}

impl HarvestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HarvestStatus::Active     => "active",
            HarvestStatus::Inactive   => "inactive",
            HarvestStatus::Harvesting => "harvesting",
            HarvestStatus::Error      => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active"     => Some(HarvestStatus::Active),
            "inactive"   => Some(HarvestStatus::Inactive),
            "harvesting" => Some(HarvestStatus::Harvesting),
            "error"      => Some(HarvestStatus::Error),
            _ => None,
        }
    }
}

/// What to do with the resumption cursor when a harvest completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CursorPolicy {
    /// Clear on completion; the next harvest starts from scratch.
    #[default]
    Reset,
    /// Keep on completion; the next harvest continues incrementally.
    /// The retained token names the last page the provider served, so
    /// resuming re-fetches that page (upserts keep this harmless); a
    /// provider that has expired the token fails the run once, after
    /// which the cleared cursor restarts from scratch.
    Retain,
}

impl CursorPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CursorPolicy::Reset  => "reset",
            CursorPolicy::Retain => "retain",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "reset"  => Some(CursorPolicy::Reset),
            "retain" => Some(CursorPolicy::Retain),
            _ => None,
        }
    }
}

/// Operator-configured external repository to harvest from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarvestSource {
    pub id: Uuid,
    pub name: String,
    pub endpoint_url: String,
    /// Metadata format identifier requested from the provider (e.g. "oai_dc").
    pub metadata_format: String,
    /// Optional set/scope filter passed on the first page request.
    pub set_spec: Option<String>,
    /// Provider allow-list applied when searching the harvested store.
    /// Empty means all providers.
    pub providers: Vec<String>,
    pub status: HarvestStatus,
    /// Schedule expression, e.g. "every 6h". None means on-demand only.
    pub schedule: Option<String>,
    pub cursor_policy: CursorPolicy,
    /// Opaque, provider-issued resumption cursor.
    pub resume_cursor: Option<String>,
    pub last_harvested: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Fields an operator supplies when creating a source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewHarvestSource {
    pub name: String,
    pub endpoint_url: String,
    #[serde(default = "default_metadata_format")]
    pub metadata_format: String,
    #[serde(default)]
    pub set_spec: Option<String>,
    #[serde(default)]
    pub providers: Vec<String>,
    #[serde(default)]
    pub schedule: Option<String>,
    #[serde(default)]
    pub cursor_policy: CursorPolicy,
}

fn default_metadata_format() -> String {
    "oai_dc".to_string()
}

/// Terminal or in-flight status of one harvest run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HarvestLogStatus {
    Running,
    Completed,
    Failed,
}

impl HarvestLogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HarvestLogStatus::Running   => "running",
            HarvestLogStatus::Completed => "completed",
            HarvestLogStatus::Failed    => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running"   => Some(HarvestLogStatus::Running),
            "completed" => Some(HarvestLogStatus::Completed),
            "failed"    => Some(HarvestLogStatus::Failed),
            _ => None,
        }
    }
}

/// One record per harvest run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarvestLog {
    pub id: Uuid,
    pub source_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: HarvestLogStatus,
    pub records_processed: i64,
    pub records_added: i64,
    pub records_updated: i64,
    pub records_failed: i64,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordAuthor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affiliation: Option<String>,
}

/// The durable normalized record harvested from one provider.
/// Keyed on (provider, record_id); re-harvesting updates in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub provider: String,
    /// Source-scoped identifier, stable across re-harvests.
    pub record_id: String,
    pub title: String,
    pub authors: Vec<RecordAuthor>,
    pub abstract_text: Option<String>,
    pub published: Option<NaiveDate>,
    pub doi: Option<String>,
    pub url: Option<String>,
    pub keywords: Vec<String>,
    pub harvested_at: DateTime<Utc>,
}

/// Result of a metadata-record upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}
