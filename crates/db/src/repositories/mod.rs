use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;

use concierge_core::errors::ServiceError;

pub mod memory;
pub mod record;
pub mod semantic;
pub mod structured;

pub use memory::{InMemoryRecordStore, InMemorySemanticMemory, InMemoryStructuredMemory};
pub use record::SqlRecordStore;
pub use semantic::SqlSemanticMemory;
pub use structured::SqlStructuredMemory;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
}

impl From<RepositoryError> for ServiceError {
    fn from(value: RepositoryError) -> Self {
        match value {
            RepositoryError::Database(error) => ServiceError::Unavailable(error.to_string()),
            RepositoryError::Decode(message) => ServiceError::Unavailable(message),
            RepositoryError::NotFound(message) => ServiceError::NotFound(message),
            RepositoryError::Conflict(message) => ServiceError::Rejected(message),
        }
    }
}

/// Fixed-width timestamps so lexical order matches chronological order.
pub(crate) fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Decode(format!("invalid timestamp in `{column}`: {e}")))
}
