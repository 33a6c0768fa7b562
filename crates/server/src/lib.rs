//! HTTP server
//!
//! Admin and client REST surfaces, the telephony bridge WebSocket, auth
//! middleware, and Prometheus metrics.

pub mod auth;
pub mod bridge;
pub mod http;
pub mod state;

pub use http::create_router;
pub use state::AppState;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use callweave_persistence::PersistenceError;
use callweave_session::SessionError;
use callweave_storage::StorageError;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("validation: {0}")]
    Validation(String),

    #[error(transparent)]
    Core(#[from] callweave_core::Error),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl ServerError {
    fn status(&self) -> StatusCode {
        let code = match self {
            ServerError::Validation(_) => 400,
            ServerError::Core(e) => e.kind().http_status(),
            ServerError::Persistence(e) => match e {
                PersistenceError::NotFound => 404,
                PersistenceError::QuotaExceeded(_) => 429,
                PersistenceError::Conflict(_) => 400,
                _ => 502,
            },
            ServerError::Session(e) => match e {
                SessionError::QuotaExceeded(_) => 429,
                SessionError::AgentUnavailable => 409,
                SessionError::NotFound => 404,
                SessionError::Persistence(_) => 502,
            },
            ServerError::Storage(e) => match e {
                StorageError::NotFound => 404,
                _ => 502,
            },
        };
        StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        // 5xx detail stays in logs, not in responses
        let message = if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
            "internal error".to_string()
        } else {
            self.to_string()
        };
        (status, axum::Json(serde_json::json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ServerError::Session(SessionError::NotFound).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ServerError::Session(SessionError::QuotaExceeded(5)).status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ServerError::Validation("bad".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ServerError::Core(callweave_core::Error::Forbidden {
                scope: "calls:read".into()
            })
            .status(),
            StatusCode::FORBIDDEN
        );
    }
}
