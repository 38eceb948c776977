//! Health, identity and shared handler helpers.

use crate::auth::require_auth;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::Json;
use axum::extract::{Request, State};
use serde::Serialize;
use serde::de::DeserializeOwned;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;

/// Read and decode a JSON request body of at most `limit` bytes.
pub async fn read_json<T: DeserializeOwned>(req: Request, limit: usize) -> ApiResult<T> {
    let bytes = axum::body::to_bytes(req.into_body(), limit)
        .await
        .map_err(|e| ApiError::BadRequest(format!("failed to read body: {e}")))?;
    serde_json::from_slice(&bytes).map_err(|e| ApiError::BadRequest(format!("invalid JSON: {e}")))
}

pub fn parse_uuid(value: &str, what: &str) -> ApiResult<Uuid> {
    Uuid::parse_str(value).map_err(|e| ApiError::BadRequest(format!("invalid {what}: {e}")))
}

pub fn rfc3339(at: OffsetDateTime) -> ApiResult<String> {
    at.format(&Rfc3339)
        .map_err(|e| ApiError::Internal(format!("failed to format timestamp: {e}")))
}

pub fn rfc3339_opt(at: Option<OffsetDateTime>) -> ApiResult<Option<String>> {
    at.map(rfc3339).transpose()
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// GET /v1/health - Health check.
///
/// Unauthenticated so load balancers and probes can call it. Fails when the
/// metadata store is unreachable.
pub async fn health_check(State(state): State<AppState>) -> ApiResult<Json<HealthResponse>> {
    state.metadata.health_check().await?;

    Ok(Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    }))
}

/// Response for the authenticated caller.
#[derive(Debug, Serialize)]
pub struct WhoamiResponse {
    pub token_id: String,
    pub gateway_id: Option<String>,
    pub scopes: Vec<String>,
    pub expires_at: Option<String>,
}

/// GET /v1/auth/whoami - Identity of the calling token.
pub async fn whoami(req: Request) -> ApiResult<Json<WhoamiResponse>> {
    let token = &require_auth(&req)?.token;

    let mut scopes: Vec<String> = token
        .scopes
        .iter()
        .map(|s| s.as_str().to_string())
        .collect();
    scopes.sort();

    Ok(Json(WhoamiResponse {
        token_id: token.id.to_string(),
        gateway_id: token.gateway_id.as_ref().map(|g| g.to_string()),
        scopes,
        expires_at: rfc3339_opt(token.expires_at)?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthenticatedUser;
    use axum::body::Body;
    use otter_core::token::{Token, TokenId, TokenScope};
    use otter_core::GatewayId;
    use std::collections::HashSet;

    #[tokio::test]
    async fn test_whoami_reports_gateway_binding() {
        let token = Token {
            id: TokenId::new(),
            gateway_id: Some(GatewayId::parse("gw-12").unwrap()),
            scopes: HashSet::from([TokenScope::FleetGateway]),
            expires_at: None,
            revoked_at: None,
            created_at: OffsetDateTime::now_utc(),
            description: None,
        };
        let mut req = Request::new(Body::empty());
        req.extensions_mut().insert(AuthenticatedUser {
            token: token.clone(),
        });

        let Json(response) = whoami(req).await.unwrap();
        assert_eq!(response.token_id, token.id.to_string());
        assert_eq!(response.gateway_id.as_deref(), Some("gw-12"));
        assert_eq!(response.scopes, vec!["fleet:gateway".to_string()]);
        assert!(response.expires_at.is_none());
    }

    #[tokio::test]
    async fn test_whoami_requires_token() {
        let err = whoami(Request::new(Body::empty())).await.unwrap_err();
        assert_eq!(err.code(), "unauthorized");
    }

    #[tokio::test]
    async fn test_read_json_rejects_garbage() {
        let req = Request::new(Body::from("{oops"));
        let err = read_json::<serde_json::Value>(req, 1024).await.unwrap_err();
        assert_eq!(err.code(), "bad_request");
    }
}
