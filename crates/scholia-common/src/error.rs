//! Error taxonomy shared by source adapters, the harvest client, and the web layer.

use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum Retry-After value honored (1 hour).
const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Closed classification of upstream-source failures.
///
/// The kind decides retry behavior: `Auth` and `Parse` never retry,
/// `Unknown` retries once, everything else retries with backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Credential or API key rejected by the provider.
    Auth,
    /// HTTP 429 or a provider-specific throttling signal.
    RateLimit,
    /// The attempt exceeded its deadline.
    Timeout,
    /// Connection-level failure (DNS, TCP, TLS).
    Network,
    /// Response received but could not be normalized; indicates schema
    /// drift requiring an adapter update.
    Parse,
    /// Anything else.
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Auth      => "auth",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Timeout   => "timeout",
            ErrorKind::Network   => "network",
            ErrorKind::Parse     => "parse",
            ErrorKind::Unknown   => "unknown",
        }
    }

    /// Whether the transport may retry a failure of this kind at all.
    pub fn retryable(&self) -> bool {
        match self {
            ErrorKind::Auth | ErrorKind::Parse => false,
            ErrorKind::RateLimit | ErrorKind::Timeout | ErrorKind::Network | ErrorKind::Unknown => {
                true
            }
        }
    }
}

/// A classified failure from one upstream source.
#[derive(Debug, Clone, Error)]
#[error("{}: {}", kind.as_str(), message)]
pub struct SourceError {
    pub kind: ErrorKind,
    pub message: String,
    /// Provider-supplied pacing hint (Retry-After), honored before the
    /// computed backoff on retry.
    pub retry_after: Option<Duration>,
    /// Overrides `kind.retryable()` for rejections that share a kind
    /// with retryable failures (e.g. a plain 4xx).
    permanent: bool,
}

impl SourceError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
            permanent: false,
        }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Auth, message)
    }

    pub fn rate_limit(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self {
            retry_after,
            ..Self::new(ErrorKind::RateLimit, message)
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Parse, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown, message)
    }

    /// A rejection that must never be retried, regardless of kind.
    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            permanent: true,
            ..Self::new(ErrorKind::Unknown, message)
        }
    }

    pub fn retryable(&self) -> bool {
        !self.permanent && self.kind.retryable()
    }

    /// Classify a non-success HTTP status.
    ///
    /// | Status        | Kind       | Retried |
    /// |---------------|------------|---------|
    /// | 401, 403      | auth       | no      |
    /// | 408           | timeout    | yes     |
    /// | 429           | rate_limit | yes     |
    /// | other 4xx     | unknown    | no      |
    /// | 5xx           | network    | yes     |
    pub fn from_status(status: StatusCode, retry_after: Option<Duration>) -> Self {
        match status.as_u16() {
            401 | 403 => Self::auth(format!("HTTP {status}: credentials rejected")),
            408 => Self::timeout(format!("HTTP {status}")),
            429 => Self::rate_limit(format!("HTTP {status}: provider throttling"), retry_after),
            400..=499 => Self::rejected(format!("HTTP {status}")),
            500..=599 => Self::network(format!("HTTP {status}")),
            _ => Self::unknown(format!("HTTP {status}")),
        }
    }
}

impl From<reqwest::Error> for SourceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::timeout(err.to_string())
        } else if err.is_connect() {
            Self::network(err.to_string())
        } else if err.is_decode() {
            Self::parse(err.to_string())
        } else if let Some(status) = err.status() {
            Self::from_status(status, None)
        } else {
            Self::unknown(err.to_string())
        }
    }
}

/// Parses a Retry-After header value into a Duration.
///
/// Accepts both RFC 7231 forms (integer seconds and HTTP-date).
/// Unparseable values yield `None`; excessive values are capped.
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<i64>() {
        if seconds < 0 {
            return None;
        }
        return Some(Duration::from_secs(seconds as u64).min(MAX_RETRY_AFTER));
    }

    let datetime = httpdate::parse_http_date(header_value).ok()?;
    match datetime.duration_since(std::time::SystemTime::now()) {
        Ok(duration) => Some(duration.min(MAX_RETRY_AFTER)),
        // Date in the past
        Err(_) => Some(Duration::ZERO),
    }
}

/// Web-facing error; every handler returns `Result<_, ApiError>`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_)   => StatusCode::NOT_FOUND,
            ApiError::Conflict(_)   => StatusCode::CONFLICT,
            ApiError::Internal(_)   => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(%self, "request failed");
        }
        let body = Json(serde_json::json!({ "message": self.to_string() }));
        (status, body).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err.to_string())
    }
}
