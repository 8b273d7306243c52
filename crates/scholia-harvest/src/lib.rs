//! scholia-harvest — cursor-driven metadata harvesting: the ListRecords
//! client, the per-run state machine, and the concurrency-capped
//! scheduler.

pub mod client;
pub mod runner;
pub mod scheduler;

pub use client::{ClientError, HarvestClient, HarvestPage};
pub use runner::{BegunHarvest, HarvestRunner, RunnerError};
pub use scheduler::{HarvestScheduler, Schedule};
