//! Authentication middleware
//!
//! Admin endpoints take `X-API-Key` against the configured shared secret;
//! client endpoints take `Authorization: Bearer cc_<prefix8>_<secret>`
//! validated against the token store. The resolved token context rides on
//! request extensions; handlers gate scopes with `require_scope`.

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};

use callweave_core::Error;
use callweave_persistence::{Scope, TokenContext};

use crate::state::AppState;
use crate::ServerError;

/// Constant-time comparison to prevent timing attacks
pub(crate) fn constant_time_compare(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

/// Admin-key middleware for `/api/admin` routes
pub async fn admin_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let expected = state.config.read().server.admin_key.clone();

    let Some(expected) = expected else {
        tracing::error!("Admin endpoint hit but no admin key is configured");
        return (StatusCode::INTERNAL_SERVER_ERROR, "admin key not configured").into_response();
    };

    let provided = request
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok());

    match provided {
        Some(key) if constant_time_compare(key.as_bytes(), expected.as_bytes()) => {
            next.run(request).await
        }
        _ => (StatusCode::UNAUTHORIZED, "invalid admin key").into_response(),
    }
}

/// Bearer-token middleware for `/api/v1` and `/webhooks` routes
pub async fn bearer_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let header_value = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    let Some(header_value) = header_value else {
        return (StatusCode::UNAUTHORIZED, "missing Authorization header").into_response();
    };

    let Some(raw) = header_value.strip_prefix("Bearer ") else {
        return (
            StatusCode::BAD_REQUEST,
            "expected Authorization: Bearer <token>",
        )
            .into_response();
    };

    match state.persistence.tokens.validate(raw).await {
        Ok(context) => {
            request.extensions_mut().insert(context);
            next.run(request).await
        }
        Err(_) => {
            // Wrong secret, unknown prefix, inactive and expired all look
            // the same to the caller
            (StatusCode::UNAUTHORIZED, "invalid token").into_response()
        }
    }
}

/// Gate a handler on a scope; the failure names only the missing scope
pub fn require_scope(context: &TokenContext, scope: Scope) -> Result<(), ServerError> {
    if context.has_scope(scope) {
        Ok(())
    } else {
        Err(ServerError::Core(Error::Forbidden {
            scope: scope.as_str().to_string(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use callweave_core::{OrgId, TokenId};

    #[test]
    fn test_constant_time_compare() {
        assert!(constant_time_compare(b"secret", b"secret"));
        assert!(!constant_time_compare(b"secret", b"secre"));
        assert!(!constant_time_compare(b"secret", b"secreT"));
        assert!(!constant_time_compare(b"abc", b"xyz"));
    }

    #[test]
    fn test_require_scope() {
        let context = TokenContext {
            token_id: TokenId::new(),
            org_id: OrgId::new(),
            scopes: vec![Scope::CallsRead],
        };

        assert!(require_scope(&context, Scope::CallsRead).is_ok());
        let err = require_scope(&context, Scope::QaWrite).unwrap_err();
        assert!(err.to_string().contains("qa:write"));
    }
}
