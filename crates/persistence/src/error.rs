//! Persistence error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("failed to connect to ScyllaDB: {0}")]
    Connection(#[from] scylla::transport::errors::NewSessionError),

    #[error("query failed: {0}")]
    Query(#[from] scylla::transport::errors::QueryError),

    #[error("schema error: {0}")]
    Schema(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("not found")]
    NotFound,

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("conflict: {0}")]
    Conflict(String),
}

impl From<PersistenceError> for callweave_core::Error {
    fn from(e: PersistenceError) -> Self {
        match e {
            PersistenceError::NotFound => callweave_core::Error::NotFound,
            PersistenceError::QuotaExceeded(msg) => callweave_core::Error::QuotaExceeded(msg),
            PersistenceError::Conflict(msg) => callweave_core::Error::validation(msg),
            PersistenceError::InvalidData(msg) => callweave_core::Error::invariant(msg),
            PersistenceError::Connection(e) => callweave_core::Error::Fatal(e.to_string()),
            other => callweave_core::Error::dependency("scylla", other),
        }
    }
}
