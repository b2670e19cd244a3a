//! Pre-shared key authentication.
//!
//! Two credentials exist:
//!
//! - the manager API key (`[auth] api_key`), required as
//!   `Authorization: Bearer <key>` on admin endpoints; `/api/health` stays
//!   open;
//! - per-environment agent tokens, checked during tunnel registration via a
//!   `?token=` query parameter (agents share the limitation browsers have:
//!   no custom headers on a WebSocket upgrade).
//!
//! Both checks compare in constant time.

use axum::{
    extract::Request,
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::environments::Environment;

/// Extension type carrying the expected API key, injected into the router
/// layer so [`require_api_key`] can access it without touching `AppState`.
#[derive(Clone)]
pub struct ApiKey(pub String);

fn auth_error(status: StatusCode, message: &str, code: &str) -> Response {
    (status, Json(json!({"error": message, "code": code}))).into_response()
}

/// Bearer credential from an `Authorization` header, if one is present and
/// well-formed.
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Axum middleware guarding the admin endpoints with the manager API key.
///
/// # Error responses
///
/// - `401 Unauthorized` — header missing or malformed (`AUTH_REQUIRED`)
/// - `403 Forbidden` — key present but invalid (`INVALID_API_KEY`)
/// - `500 Internal Server Error` — [`ApiKey`] extension not installed
pub async fn require_api_key(request: Request, next: Next) -> Response {
    let Some(expected) = request.extensions().get::<ApiKey>().map(|k| k.0.clone()) else {
        return auth_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Server configuration error",
            "MISCONFIGURED",
        );
    };

    let Some(provided) = bearer_token(request.headers()) else {
        return auth_error(
            StatusCode::UNAUTHORIZED,
            "Missing or invalid Authorization header",
            "AUTH_REQUIRED",
        );
    };

    if !constant_time_eq(expected.as_bytes(), provided.as_bytes()) {
        return auth_error(StatusCode::FORBIDDEN, "Invalid API key", "INVALID_API_KEY");
    }

    next.run(request).await
}

/// Check a registering agent's token against its environment descriptor.
pub fn verify_agent_token(environment: &Environment, provided: &str) -> bool {
    constant_time_eq(environment.token.as_bytes(), provided.as_bytes())
}

/// Constant-time byte comparison so response timing leaks neither the key
/// nor its length. Always walks the full expected length; missing provided
/// bytes compare against a sentinel that can never match.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for (i, &e) in expected.iter().enumerate() {
        diff |= e ^ provided.get(i).copied().unwrap_or(0xff);
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secreT"));
        assert!(!constant_time_eq(b"secret", b"secre"));
        assert!(!constant_time_eq(b"secret", b""));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn test_bearer_token_extraction() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert("authorization", "Bearer abc123".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("abc123"));

        headers.insert("authorization", "Basic abc123".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn test_verify_agent_token() {
        let environment = Environment {
            id: "env-1".to_string(),
            name: "rack 1".to_string(),
            api_url: None,
            token: "shared-secret".to_string(),
            enabled: true,
        };
        assert!(verify_agent_token(&environment, "shared-secret"));
        assert!(!verify_agent_token(&environment, "shared-secre"));
        assert!(!verify_agent_token(&environment, ""));
    }
}
