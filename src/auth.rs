//! Authentication for both ingress paths
//!
//! Agents authenticate once per session inside the `identify`
//! handshake; admin HTTP callers present an API key on every request.
//! Both comparisons are constant-time.

use async_trait::async_trait;
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

use crate::config::AuthConfig;

/// Token validation seam for the `identify` handshake.
#[async_trait]
pub trait AuthTokens: Send + Sync {
    async fn validate(&self, agent_id: &str, token: &str) -> bool;
}

/// Validates agent tokens against the configured shared secret.
pub struct StaticTokenAuth {
    token: String,
}

impl StaticTokenAuth {
    pub fn new(token: String) -> Self {
        Self { token }
    }
}

#[async_trait]
impl AuthTokens for StaticTokenAuth {
    async fn validate(&self, _agent_id: &str, token: &str) -> bool {
        token.as_bytes().ct_eq(self.token.as_bytes()).into()
    }
}

#[derive(Clone)]
pub struct AuthState {
    pub config: AuthConfig,
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": "Unauthorized"})),
    )
        .into_response()
}

/// Admin API authentication middleware.
///
/// Accepts the key in `x-api-key` or as a `Bearer` authorization
/// header. CORS preflights pass through so browsers can negotiate.
pub async fn auth_middleware(
    State(auth_state): State<Arc<AuthState>>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Result<Response, Response> {
    let path = request.uri().path().to_string();

    if request.method() == Method::OPTIONS {
        return Ok(next.run(request).await);
    }

    let provided_key = if let Some(header_value) = headers.get("x-api-key") {
        header_value.to_str().map_err(|_| {
            warn!(%path, "malformed x-api-key header");
            unauthorized()
        })?
    } else if let Some(header_value) = headers.get("authorization") {
        let auth_str = header_value.to_str().map_err(|_| {
            warn!(%path, "malformed authorization header");
            unauthorized()
        })?;
        match auth_str.strip_prefix("Bearer ") {
            Some(token) => token,
            None => {
                warn!(%path, "authorization header without Bearer prefix");
                return Err(unauthorized());
            }
        }
    } else {
        warn!(%path, "missing API key");
        return Err(unauthorized());
    };

    let expected = auth_state.config.api_key.as_bytes();
    if provided_key.as_bytes().ct_eq(expected).into() {
        Ok(next.run(request).await)
    } else {
        warn!(%path, "authentication failed");
        Err(unauthorized())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_token_auth() {
        let auth = StaticTokenAuth::new("super-secret-agent-token".to_string());
        assert!(auth.validate("a-1", "super-secret-agent-token").await);
        assert!(!auth.validate("a-1", "wrong").await);
        assert!(!auth.validate("a-1", "").await);
    }
}
