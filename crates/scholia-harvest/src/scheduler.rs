//! Scheduling: a global concurrency cap over harvest runs, on-demand
//! triggering, and a tick loop that starts due scheduled sources.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tracing::{info, warn};
use uuid::Uuid;

use scholia_db::{Database, HarvestLog, HarvestSource, HarvestSourceRepository, HarvestStatus};

use crate::runner::{HarvestRunner, RunnerError};

/// "every <n><unit>" with unit s, m, h, or d. Example: "every 6h".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    interval: Duration,
}

impl Schedule {
    pub fn parse(expr: &str) -> Option<Self> {
        let rest = expr.trim().strip_prefix("every")?.trim();
        if rest.is_empty() {
            return None;
        }
        let unit = rest.chars().last()?;
        let amount: u64 = rest[..rest.len() - unit.len_utf8()].trim().parse().ok()?;
        if amount == 0 {
            return None;
        }
        let secs = match unit {
            's' => amount,
            'm' => amount * 60,
            'h' => amount * 3600,
            'd' => amount * 86_400,
            _ => return None,
        };
        Some(Self {
            interval: Duration::from_secs(secs),
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Due when never harvested, or when the interval has elapsed since
    /// the last successful run.
    pub fn is_due(&self, last_harvested: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match last_harvested {
            None => true,
            Some(last) => {
                let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
                elapsed >= self.interval
            }
        }
    }
}

pub struct HarvestScheduler {
    runner: Arc<HarvestRunner>,
    sources: HarvestSourceRepository,
    permits: Arc<Semaphore>,
    tick_interval: Duration,
}

impl HarvestScheduler {
    pub fn new(
        runner: Arc<HarvestRunner>,
        db: Database,
        max_concurrent: usize,
        tick_interval: Duration,
    ) -> Self {
        Self {
            runner,
            sources: HarvestSourceRepository::new(db),
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            tick_interval,
        }
    }

    /// Starts a harvest for the source. Admission (the 409 check and the
    /// running log) happens before this returns; the page loop runs in a
    /// background task that first waits its turn under the concurrency
    /// cap. An admitted run is never rejected by the cap, only delayed.
    pub async fn trigger(&self, source_id: Uuid) -> Result<HarvestLog, RunnerError> {
        let begun = self.runner.begin(source_id).await?;
        let log = begun.log.clone();

        let runner = self.runner.clone();
        let permits = self.permits.clone();
        tokio::spawn(async move {
            // Closed only on shutdown
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            runner.drive(begun).await;
        });

        Ok(log)
    }

    /// Tick loop: starts due scheduled sources until shutdown.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(tick_secs = self.tick_interval.as_secs(), "harvest scheduler started");

        loop {
            ticker.tick().await;
            if let Err(e) = self.tick(Utc::now()).await {
                warn!(error = %e, "scheduler tick failed");
            }
        }
    }

    /// One pass over the configured sources.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<(), RunnerError> {
        for source in self.sources.list().await? {
            if !self.is_scheduled_and_due(&source, now) {
                continue;
            }
            match self.trigger(source.id).await {
                Ok(log) => info!(source = %source.name, log_id = %log.id, "scheduled harvest started"),
                // Lost to a concurrent trigger; the next tick reconsiders
                Err(RunnerError::AlreadyRunning(_)) => {}
                Err(e) => warn!(source = %source.name, error = %e, "scheduled harvest failed to start"),
            }
        }
        Ok(())
    }

    fn is_scheduled_and_due(&self, source: &HarvestSource, now: DateTime<Utc>) -> bool {
        // Operator-disabled sources are only harvested by explicit
        // trigger; errored sources stay on the schedule so they retry.
        if source.status == HarvestStatus::Inactive {
            return false;
        }
        let Some(expr) = source.schedule.as_deref() else {
            return false;
        };
        let Some(schedule) = Schedule::parse(expr) else {
            warn!(source = %source.name, expr, "unparseable schedule expression");
            return false;
        };
        schedule.is_due(source.last_harvested, now)
    }
}
