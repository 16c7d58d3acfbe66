//! API-key middleware for the monitor HTTP surface.

use crate::config::ApiConfig;
use axum::{
    extract::{Request, State},
    http::{HeaderMap, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::warn;

#[derive(Clone)]
pub struct AuthState {
    pub config: ApiConfig,
}

pub fn create_auth_state(config: ApiConfig) -> Arc<AuthState> {
    Arc::new(AuthState { config })
}

fn unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({"error": "Unauthorized"}))).into_response()
}

fn extract_key(headers: &HeaderMap) -> Option<&str> {
    if let Some(v) = headers.get("x-api-key") {
        return v.to_str().ok();
    }
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
}

/// No-op when `config.api_key` is unset (auth disabled); otherwise requires
/// a matching key via `x-api-key` or `Authorization: Bearer`.
pub async fn auth_middleware(
    State(auth_state): State<Arc<AuthState>>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Result<Response, Response> {
    if request.method() == Method::OPTIONS {
        return Ok(next.run(request).await);
    }

    let Some(expected_key) = &auth_state.config.api_key else {
        return Ok(next.run(request).await);
    };

    let path = request.uri().path().to_string();
    let Some(provided) = extract_key(&headers) else {
        warn!(path, "request missing api key");
        return Err(unauthorized());
    };

    if provided.as_bytes().ct_eq(expected_key.as_bytes()).into() {
        Ok(next.run(request).await)
    } else {
        warn!(path, "request had invalid api key");
        Err(unauthorized())
    }
}
