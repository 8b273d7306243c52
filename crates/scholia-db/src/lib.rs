//! scholia-db — SQLite-backed store for harvest sources, harvest logs,
//! and the normalized metadata records the harvester produces.

pub mod database;
pub mod error;
pub mod logs;
pub mod models;
pub mod records;
pub mod sources;

pub use database::Database;
pub use error::{DbError, Result};
pub use logs::{HarvestLogRepository, HarvestMetrics};
pub use models::{
    CursorPolicy, HarvestLog, HarvestLogStatus, HarvestSource, HarvestStatus, MetadataRecord,
    NewHarvestSource, RecordAuthor, UpsertOutcome,
};
pub use records::{MetadataRecordRepository, RecordFilter};
pub use sources::HarvestSourceRepository;
