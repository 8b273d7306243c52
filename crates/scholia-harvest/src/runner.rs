//! Drives one harvest run: admission, the page loop, and the terminal
//! transition.
//!
//! Admission is synchronous and atomic so callers can answer 409 before
//! any network work happens. The page loop commits the cursor before
//! the counters, so a crash between the two can only under-report
//! counts, never lose or replay a committed page.

use thiserror::Error;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use scholia_db::{
    CursorPolicy, Database, DbError, HarvestLog, HarvestLogRepository, HarvestLogStatus,
    HarvestSource, HarvestSourceRepository, MetadataRecordRepository,
};

use crate::client::{ClientError, HarvestClient};

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("harvest source not found: {0}")]
    NotFound(Uuid),
    /// Another run holds the source; admission lost the race.
    #[error("a harvest is already running for source {0}")]
    AlreadyRunning(Uuid),
    #[error(transparent)]
    Db(#[from] DbError),
}

/// An admitted run: the source is marked harvesting and a running log
/// row exists. The caller must drive it to a terminal state.
#[derive(Debug)]
pub struct BegunHarvest {
    pub source: HarvestSource,
    pub log: HarvestLog,
}

pub struct HarvestRunner {
    client: HarvestClient,
    sources: HarvestSourceRepository,
    logs: HarvestLogRepository,
    records: MetadataRecordRepository,
}

impl HarvestRunner {
    pub fn new(client: HarvestClient, db: Database) -> Self {
        Self {
            client,
            sources: HarvestSourceRepository::new(db.clone()),
            logs: HarvestLogRepository::new(db.clone()),
            records: MetadataRecordRepository::new(db),
        }
    }

    /// Atomic admission: claims the source and opens a running log.
    /// Exactly one concurrent caller wins; the rest see AlreadyRunning.
    pub async fn begin(&self, source_id: Uuid) -> Result<BegunHarvest, RunnerError> {
        let source = self
            .sources
            .get(source_id)
            .await?
            .ok_or(RunnerError::NotFound(source_id))?;

        if !self.sources.try_mark_harvesting(source_id).await? {
            return Err(RunnerError::AlreadyRunning(source_id));
        }

        let log = self.logs.create_running(source_id).await?;
        info!(source = %source.name, log_id = %log.id, "harvest admitted");
        Ok(BegunHarvest { source, log })
    }

    /// Runs the page loop to a terminal state. Never returns an error:
    /// every failure is recorded on the log and the source.
    #[instrument(skip(self, begun), fields(source = %begun.source.name, log_id = %begun.log.id))]
    pub async fn drive(&self, begun: BegunHarvest) {
        let BegunHarvest { source, log } = begun;
        let mut cursor = source.resume_cursor.clone();
        let mut last_cursor = cursor.clone();

        loop {
            let page = match self.client.fetch_page(&source, cursor.as_deref()).await {
                Ok(page) => page,
                Err(ClientError::BadCursor) => {
                    // The saved cursor is dead; clear it so the next run
                    // restarts from the beginning.
                    warn!(source = %source.name, "resumption cursor rejected, clearing");
                    if let Err(e) = self.sources.save_cursor(source.id, None).await {
                        error!(error = %e, "failed to clear cursor");
                    }
                    self.finish_failed(&source, log.id, "provider rejected the resumption cursor")
                        .await;
                    return;
                }
                Err(ClientError::Source(e)) => {
                    self.finish_failed(&source, log.id, &e.to_string()).await;
                    return;
                }
            };

            let mut added = 0i64;
            let mut updated = 0i64;
            let mut failed = 0i64;
            for record in &page.records {
                match self.records.upsert(record).await {
                    Ok(scholia_db::UpsertOutcome::Inserted) => added += 1,
                    Ok(scholia_db::UpsertOutcome::Updated) => updated += 1,
                    Err(e) => {
                        warn!(record_id = %record.record_id, error = %e, "record rejected");
                        failed += 1;
                    }
                }
            }
            let processed = page.records.len() as i64 + page.skipped_deleted as i64;

            // Cursor first, counts second.
            if let Err(e) = self.sources.save_cursor(source.id, page.cursor.as_deref()).await {
                self.finish_failed(&source, log.id, &format!("cursor commit failed: {e}"))
                    .await;
                return;
            }
            if let Err(e) = self
                .logs
                .add_counts(log.id, processed, added, updated, failed)
                .await
            {
                self.finish_failed(&source, log.id, &format!("count commit failed: {e}"))
                    .await;
                return;
            }

            if page.cursor.is_some() {
                last_cursor = page.cursor.clone();
            }
            cursor = page.cursor;
            if cursor.is_none() {
                break;
            }
        }

        let final_cursor = match source.cursor_policy {
            CursorPolicy::Reset => None,
            CursorPolicy::Retain => last_cursor,
        };
        if let Err(e) = self.sources.complete(source.id, final_cursor.as_deref()).await {
            error!(error = %e, "failed to finalize source after harvest");
        }
        if let Err(e) = self
            .logs
            .finalize(log.id, HarvestLogStatus::Completed, None)
            .await
        {
            error!(error = %e, "failed to finalize harvest log");
        }
        info!(source = %source.name, "harvest completed");
    }

    /// Convenience for call sites that do not need the 202/409 split.
    pub async fn run(&self, source_id: Uuid) -> Result<(), RunnerError> {
        let begun = self.begin(source_id).await?;
        self.drive(begun).await;
        Ok(())
    }

    async fn finish_failed(&self, source: &HarvestSource, log_id: Uuid, message: &str) {
        error!(source = %source.name, message, "harvest failed");
        if let Err(e) = self.sources.fail(source.id).await {
            error!(error = %e, "failed to mark source errored");
        }
        if let Err(e) = self
            .logs
            .finalize(log_id, HarvestLogStatus::Failed, Some(message))
            .await
        {
            error!(error = %e, "failed to finalize harvest log");
        }
    }
}
