//! scholia-common — Shared error types and configuration used across all Scholia crates.

pub mod config;
pub mod error;

pub use config::AppConfig;
pub use error::{parse_retry_after, ApiError, ErrorKind, SourceError};
