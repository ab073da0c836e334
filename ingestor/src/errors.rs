use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store write exceeded the {0:?} deadline")]
    DeadlineExceeded(Duration),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether retrying the same operation later has a chance of succeeding.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Database(db_err) => crate::store::postgres::is_transient_error(db_err),
            Error::Io(_) | Error::DeadlineExceeded(_) => true,
            Error::Migration(_) | Error::Validation(_) | Error::Config(_) => false,
        }
    }
}

/// Rejection reasons reported back to a gateway by the ingestion core.
///
/// This is a closed set: every failure of `Ingest` maps onto exactly one of
/// these, and none of them is retried internally.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IngestError {
    /// Credential missing or not recognised.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// Credential valid, but not for this dashboard/field or this kind of call.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// The reading was not durably recorded.
    #[error("store unavailable: {detail}")]
    StoreUnavailable { detail: String, retryable: bool },
}

impl IngestError {
    /// Stable machine-readable code, also used as a metric label.
    pub fn code(&self) -> &'static str {
        match self {
            IngestError::Unauthenticated(_) => "UNAUTHENTICATED",
            IngestError::Unauthorized(_) => "UNAUTHORIZED",
            IngestError::NotFound(_) => "NOT_FOUND",
            IngestError::InvalidValue(_) => "INVALID_VALUE",
            IngestError::StoreUnavailable { .. } => "STORE_UNAVAILABLE",
        }
    }
}

impl From<Error> for IngestError {
    fn from(err: Error) -> Self {
        match err {
            Error::Validation(msg) => IngestError::InvalidValue(msg),
            other => IngestError::StoreUnavailable {
                retryable: other.is_transient(),
                detail: other.to_string(),
            },
        }
    }
}
