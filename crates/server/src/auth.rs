//! Authentication middleware and trace ids.

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use otter_core::GatewayId;
use otter_core::token::{Token, TokenId, TokenScope};
use otter_metadata::models::TokenRow;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use time::OffsetDateTime;
use tracing::Instrument;
use uuid::Uuid;

/// Longer client-supplied trace ids are truncated.
const MAX_TRACE_ID_LEN: usize = 128;

/// Trace ID for request correlation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TraceId(pub String);

impl TraceId {
    /// Generate a new random trace ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Sanitize a client-provided value: at most 128 characters, printable
    /// ASCII only. Falls back to a fresh id when nothing survives.
    pub fn from_client(value: &str) -> Self {
        let sanitized: String = value
            .chars()
            .take(MAX_TRACE_ID_LEN)
            .filter(|c| c.is_ascii_graphic() || *c == ' ')
            .collect();

        if sanitized.trim().is_empty() {
            Self::new()
        } else {
            Self(sanitized)
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TraceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TraceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Authenticated request extension.
#[derive(Clone, Debug)]
pub struct AuthenticatedUser {
    /// The validated token.
    pub token: Token,
}

impl AuthenticatedUser {
    pub fn has_scope(&self, scope: TokenScope) -> bool {
        self.token.has_scope(scope)
    }

    /// Require a specific scope, returning an error if not present.
    pub fn require_scope(&self, scope: TokenScope) -> ApiResult<()> {
        if self.has_scope(scope) {
            Ok(())
        } else {
            Err(ApiError::Forbidden(format!("missing required scope: {scope}")))
        }
    }

    /// Require permission to poll and report as `gateway`.
    pub fn require_gateway(&self, gateway: &GatewayId) -> ApiResult<()> {
        self.require_scope(TokenScope::FleetGateway)?;
        if self.token.can_act_for(gateway) {
            Ok(())
        } else {
            Err(ApiError::Forbidden(format!(
                "token is not bound to gateway {gateway}"
            )))
        }
    }
}

/// Extract bearer token from Authorization header.
/// The "Bearer" scheme is case-insensitive (RFC 6750).
fn extract_bearer_token(req: &Request) -> Option<&str> {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            if v.len() >= 7 && v[..7].eq_ignore_ascii_case("bearer ") {
                Some(v[7..].trim())
            } else {
                None
            }
        })
}

fn extract_or_generate_trace_id(req: &Request) -> TraceId {
    req.headers()
        .get("x-trace-id")
        .and_then(|v| v.to_str().ok())
        .map(TraceId::from_client)
        .unwrap_or_else(TraceId::new)
}

/// Hash a token secret for storage lookup (lowercase hex SHA-256).
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Convert a stored row into a domain token. Unknown scopes are dropped with a
/// warning; a malformed gateway binding invalidates the token.
pub fn token_from_row(row: &TokenRow) -> ApiResult<Token> {
    let scopes: Vec<String> = serde_json::from_str(&row.scopes)
        .map_err(|e| ApiError::Internal(format!("invalid token scopes: {e}")))?;

    let scopes: HashSet<TokenScope> = scopes
        .iter()
        .filter_map(|s| match TokenScope::parse(s) {
            Ok(scope) => Some(scope),
            Err(_) => {
                tracing::warn!(
                    token_id = %row.token_id,
                    invalid_scope = %s,
                    "Token contains invalid scope, ignoring"
                );
                None
            }
        })
        .collect();

    let gateway_id = row
        .gateway_id
        .as_deref()
        .map(GatewayId::parse)
        .transpose()
        .map_err(|e| ApiError::Internal(format!("invalid token gateway binding: {e}")))?;

    Ok(Token {
        id: TokenId::parse(&row.token_id.to_string())?,
        gateway_id,
        scopes,
        expires_at: row.expires_at,
        revoked_at: row.revoked_at,
        created_at: row.created_at,
        description: row.description.clone(),
    })
}

/// Authentication middleware that validates tokens and sets up trace context.
///
/// Requests without a token pass through unauthenticated; handlers decide
/// whether they need a caller.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let trace_id = extract_or_generate_trace_id(&req);
    let trace_id_str = trace_id.0.clone();
    req.extensions_mut().insert(trace_id);

    if let Some(token_str) = extract_bearer_token(&req) {
        let token_hash = hash_token(token_str);

        if let Some(token_row) = state.metadata.get_token_by_hash(&token_hash).await? {
            let token = token_from_row(&token_row)?;

            if !token.is_valid() {
                return Err(ApiError::Unauthorized(
                    "token expired or revoked".to_string(),
                ));
            }

            // Fire and forget.
            let metadata = state.metadata.clone();
            let token_id = token_row.token_id;
            tokio::spawn(async move {
                if let Err(e) = metadata
                    .touch_token(token_id, OffsetDateTime::now_utc())
                    .await
                {
                    tracing::debug!(token_id = %token_id, error = %e, "Failed to touch token");
                }
            });

            req.extensions_mut().insert(AuthenticatedUser { token });
        } else {
            return Err(ApiError::Unauthorized("unknown token".to_string()));
        }
    }

    let response = next
        .run(req)
        .instrument(tracing::info_span!("request", trace_id = %trace_id_str))
        .await;

    Ok(response)
}

/// Require authentication (token must be present).
pub fn require_auth(req: &Request) -> ApiResult<&AuthenticatedUser> {
    req.extensions()
        .get::<AuthenticatedUser>()
        .ok_or_else(|| ApiError::Unauthorized("authentication required".to_string()))
}

/// Get the trace ID from request extensions.
pub fn get_trace_id(req: &Request) -> Option<&TraceId> {
    req.extensions().get::<TraceId>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn request_with_auth(value: &str) -> Request {
        Request::builder()
            .header(AUTHORIZATION, value)
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn test_bearer_scheme_case_insensitive() {
        assert_eq!(
            extract_bearer_token(&request_with_auth("Bearer abc")),
            Some("abc")
        );
        assert_eq!(
            extract_bearer_token(&request_with_auth("bearer abc")),
            Some("abc")
        );
        assert_eq!(extract_bearer_token(&request_with_auth("Basic abc")), None);
    }

    #[test]
    fn test_trace_id_sanitized() {
        let long = "a".repeat(300);
        assert_eq!(TraceId::from_client(&long).as_str().len(), MAX_TRACE_ID_LEN);
        assert_eq!(TraceId::from_client("abc\ndef").as_str(), "abcdef");
        assert_ne!(TraceId::from_client("\n\t").as_str(), "");
    }

    #[test]
    fn test_hash_token_is_lowercase_sha256() {
        assert_eq!(
            hash_token("test-admin-token"),
            "17d6bfe05d1b1fb7bc499f8e3f639c7b3eda4c40f321eef8887a0c04c89a99c5"
        );
    }

    #[test]
    fn test_token_from_row_binds_gateway() {
        let row = TokenRow {
            token_id: Uuid::new_v4(),
            gateway_id: Some("gw-1".to_string()),
            token_hash: hash_token("x"),
            scopes: r#"["fleet:gateway","bogus"]"#.to_string(),
            expires_at: None,
            revoked_at: None,
            created_at: OffsetDateTime::now_utc(),
            last_used_at: None,
            description: None,
        };
        let token = token_from_row(&row).unwrap();
        assert_eq!(token.scopes.len(), 1);
        let user = AuthenticatedUser { token };
        assert!(user.require_gateway(&GatewayId::parse("gw-1").unwrap()).is_ok());
        assert!(matches!(
            user.require_gateway(&GatewayId::parse("gw-2").unwrap()),
            Err(ApiError::Forbidden(_))
        ));
        assert!(user.require_scope(TokenScope::FleetAdmin).is_err());
    }
}
