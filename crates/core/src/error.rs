//! Error taxonomy shared across components
//!
//! Failures are classified by kind, not by source type. External failures
//! degrade the session; only invariant violations are fatal to it. The
//! server layer maps kinds onto HTTP statuses.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed input at a boundary; never propagates into sessions
    Validation,
    /// Missing or expired credentials
    Unauthenticated,
    /// Credential valid but lacks a required scope
    Forbidden,
    /// Resource does not exist in the caller's tenant
    NotFound,
    /// A per-org quota was hit
    QuotaExceeded,
    /// A process-wide capacity cap was hit
    Overloaded,
    /// An external service timed out or errored; the pipeline degrades
    Dependency,
    /// An internal contract was broken; fatal to the session
    Invariant,
    /// The process cannot continue (data store unreachable, key missing)
    Fatal,
}

impl ErrorKind {
    /// HTTP status the server layer maps this kind to
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::Validation => 400,
            ErrorKind::Unauthenticated => 401,
            ErrorKind::Forbidden => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::QuotaExceeded | ErrorKind::Overloaded => 429,
            ErrorKind::Dependency => 502,
            ErrorKind::Invariant | ErrorKind::Fatal => 500,
        }
    }

    /// Whether a session hitting this error must move to `error` status
    pub fn is_session_fatal(self) -> bool {
        matches!(self, ErrorKind::Invariant | ErrorKind::Fatal)
    }
}

/// Component error carrying its classification
#[derive(Debug, Error)]
pub enum Error {
    #[error("validation: {0}")]
    Validation(String),

    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("forbidden: missing scope {scope}")]
    Forbidden { scope: String },

    #[error("not found")]
    NotFound,

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("overloaded: {0}")]
    Overloaded(String),

    #[error("dependency {stage} failed: {message}")]
    Dependency { stage: String, message: String },

    #[error("invariant violation: {0}")]
    Invariant(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) => ErrorKind::Validation,
            Error::Unauthenticated(_) => ErrorKind::Unauthenticated,
            Error::Forbidden { .. } => ErrorKind::Forbidden,
            Error::NotFound => ErrorKind::NotFound,
            Error::QuotaExceeded(_) => ErrorKind::QuotaExceeded,
            Error::Overloaded(_) => ErrorKind::Overloaded,
            Error::Dependency { .. } => ErrorKind::Dependency,
            Error::Invariant(_) => ErrorKind::Invariant,
            Error::Fatal(_) => ErrorKind::Fatal,
        }
    }

    /// Degraded-stage constructor used by every external adapter
    pub fn dependency(stage: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Error::Dependency {
            stage: stage.into(),
            message: message.to_string(),
        }
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        Error::Invariant(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation(message.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(Error::NotFound.kind(), ErrorKind::NotFound);
        assert_eq!(
            Error::dependency("stt", "timeout").kind(),
            ErrorKind::Dependency
        );
    }

    #[test]
    fn test_http_status() {
        assert_eq!(ErrorKind::NotFound.http_status(), 404);
        assert_eq!(ErrorKind::QuotaExceeded.http_status(), 429);
        assert_eq!(ErrorKind::Unauthenticated.http_status(), 401);
    }

    #[test]
    fn test_session_fatality() {
        assert!(ErrorKind::Invariant.is_session_fatal());
        assert!(!ErrorKind::Dependency.is_session_fatal());
    }
}
