//! Shared application state for the web server.

use std::sync::Arc;

use scholia_common::AppConfig;
use scholia_db::{Database, HarvestLogRepository, HarvestSourceRepository};
use scholia_harvest::HarvestScheduler;
use scholia_search::SearchDispatcher;

/// Shared state injected into every Axum handler.
pub struct AppState {
    pub config: AppConfig,
    pub dispatcher: SearchDispatcher,
    pub scheduler: Arc<HarvestScheduler>,
    pub sources: HarvestSourceRepository,
    pub logs: HarvestLogRepository,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        db: Database,
        dispatcher: SearchDispatcher,
        scheduler: Arc<HarvestScheduler>,
    ) -> Self {
        Self {
            config,
            dispatcher,
            scheduler,
            sources: HarvestSourceRepository::new(db.clone()),
            logs: HarvestLogRepository::new(db),
        }
    }
}

pub type SharedState = Arc<AppState>;
