//! scholia-web — HTTP surface over the federated search dispatcher and
//! the harvest scheduler.

pub mod handlers;
pub mod router;
pub mod state;

use std::sync::Arc;
use std::time::Duration;

use scholia_common::AppConfig;
use scholia_db::Database;
use scholia_harvest::{HarvestClient, HarvestRunner, HarvestScheduler};
use scholia_search::sources::arxiv::ArxivSource;
use scholia_search::sources::pubmed::PubMedSource;
use scholia_search::{RetryPolicy, SearchDispatcher, Transport};

/// Wires the production dispatcher: PubMed and arXiv behind their own
/// paced transports. Harvested sources are not registered here; the
/// dispatcher resolves them from the database on every request.
pub fn build_dispatcher(config: &AppConfig, db: Database) -> SearchDispatcher {
    let search = &config.search;
    let policy = RetryPolicy::from_config(&search.retry);

    let pubmed = PubMedSource::new(
        &search.pubmed,
        Transport::with_pacing(
            policy.clone(),
            Duration::from_millis(search.pubmed.min_request_interval_ms),
        ),
    );
    let arxiv = ArxivSource::new(Transport::with_pacing(
        policy,
        Duration::from_millis(search.arxiv.min_request_interval_ms),
    ));

    SearchDispatcher::new(db, Duration::from_secs(search.source_timeout_secs))
        .register(Arc::new(pubmed))
        .register(Arc::new(arxiv))
}

/// Wires the harvest runner and scheduler from config.
pub fn build_scheduler(config: &AppConfig, db: Database) -> Arc<HarvestScheduler> {
    let harvest = &config.harvest;
    let runner = Arc::new(HarvestRunner::new(
        HarvestClient::new(Transport::new(RetryPolicy::from_config(&harvest.retry))),
        db.clone(),
    ));
    Arc::new(HarvestScheduler::new(
        runner,
        db,
        harvest.max_concurrent,
        Duration::from_secs(harvest.tick_interval_secs),
    ))
}
