//! Administrative endpoints: token management and escalations.

use crate::auth::{hash_token, require_auth};
use crate::context::RequestContext;
use crate::error::{ApiError, ApiResult};
use crate::handlers::common::{parse_uuid, read_json, rfc3339, rfc3339_opt};
use crate::state::AppState;
use crate::tracker::EscalationView;
use axum::Json;
use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use otter_core::GatewayId;
use otter_core::token::{CreateTokenRequest, CreateTokenResponse, TokenScope};
use otter_metadata::models::TokenRow;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Maximum request body size for admin endpoints (64 KiB).
const MAX_ADMIN_BODY_SIZE: usize = 64 * 1024;

/// Token information (never includes the secret).
#[derive(Debug, Serialize)]
pub struct TokenInfo {
    pub token_id: String,
    pub gateway_id: Option<String>,
    pub scopes: Vec<String>,
    pub expires_at: Option<String>,
    pub revoked_at: Option<String>,
    pub created_at: String,
    pub last_used_at: Option<String>,
    pub description: Option<String>,
}

impl TokenInfo {
    fn from_row(row: TokenRow) -> ApiResult<Self> {
        let scopes: Vec<String> = serde_json::from_str(&row.scopes)
            .map_err(|e| ApiError::Internal(format!("invalid token scopes: {e}")))?;
        Ok(Self {
            token_id: row.token_id.to_string(),
            gateway_id: row.gateway_id,
            scopes,
            expires_at: rfc3339_opt(row.expires_at)?,
            revoked_at: rfc3339_opt(row.revoked_at)?,
            created_at: rfc3339(row.created_at)?,
            last_used_at: rfc3339_opt(row.last_used_at)?,
            description: row.description,
        })
    }
}

fn generate_token_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// POST /v1/admin/tokens - Issue a token.
///
/// Gateway tokens should carry a `gateway_id` so they can only report for
/// that gateway. Admin tokens cannot be bound to a gateway.
pub async fn create_token(
    State(state): State<AppState>,
    req: Request,
) -> ApiResult<(StatusCode, Json<CreateTokenResponse>)> {
    let (ctx, auth) = RequestContext::from_request(&req)?;
    auth.require_scope(TokenScope::FleetAdmin)?;

    let body: CreateTokenRequest = read_json(req, MAX_ADMIN_BODY_SIZE).await?;

    if body.scopes.is_empty() {
        return Err(ApiError::BadRequest("at least one scope is required".to_string()));
    }
    let mut scopes = Vec::with_capacity(body.scopes.len());
    for scope in &body.scopes {
        scopes.push(
            TokenScope::parse(scope)
                .map_err(|_| ApiError::BadRequest(format!("invalid scope: {scope}")))?,
        );
    }

    let gateway_id = body
        .gateway_id
        .as_deref()
        .map(GatewayId::parse)
        .transpose()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    if gateway_id.is_some() && scopes.contains(&TokenScope::FleetAdmin) {
        return Err(ApiError::BadRequest(
            "fleet:admin tokens cannot be bound to a gateway".to_string(),
        ));
    }

    let now = OffsetDateTime::now_utc();
    let expires_at = match body.expires_in {
        Some(secs) => {
            let secs = i64::try_from(secs)
                .map_err(|_| ApiError::BadRequest(format!("expires_in too large: {secs}")))?;
            Some(now + time::Duration::seconds(secs))
        }
        None => None,
    };

    let token_secret = generate_token_secret();
    let row = TokenRow {
        token_id: Uuid::new_v4(),
        gateway_id: gateway_id.as_ref().map(|g| g.to_string()),
        token_hash: hash_token(&token_secret),
        scopes: serde_json::to_string(&body.scopes)
            .map_err(|e| ApiError::Internal(format!("failed to serialize scopes: {e}")))?,
        expires_at,
        revoked_at: None,
        created_at: now,
        last_used_at: None,
        description: body.description,
    };
    state.metadata.create_token(&row).await?;

    tracing::info!(
        trace_id = %ctx.trace_id,
        actor = %ctx.actor,
        token_id = %row.token_id,
        gateway_id = row.gateway_id.as_deref().unwrap_or(""),
        "Token issued"
    );

    Ok((
        StatusCode::CREATED,
        Json(CreateTokenResponse {
            token_id: row.token_id.to_string(),
            token_secret,
            expires_at: rfc3339_opt(expires_at)?,
        }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct ListTokensQuery {
    pub gateway_id: Option<String>,
}

/// GET /v1/admin/tokens - List tokens, optionally for one gateway.
pub async fn list_tokens(
    State(state): State<AppState>,
    Query(query): Query<ListTokensQuery>,
    req: Request,
) -> ApiResult<Json<Vec<TokenInfo>>> {
    require_auth(&req)?.require_scope(TokenScope::FleetAdmin)?;

    let rows = state
        .metadata
        .list_tokens(query.gateway_id.as_deref())
        .await?;
    let tokens = rows
        .into_iter()
        .map(TokenInfo::from_row)
        .collect::<ApiResult<Vec<_>>>()?;
    Ok(Json(tokens))
}

/// DELETE /v1/admin/tokens/{token_id} - Revoke a token.
pub async fn revoke_token(
    State(state): State<AppState>,
    Path(token_id): Path<String>,
    req: Request,
) -> ApiResult<StatusCode> {
    let (ctx, auth) = RequestContext::from_request(&req)?;
    auth.require_scope(TokenScope::FleetAdmin)?;

    let token_id = parse_uuid(&token_id, "token ID")?;
    if state.metadata.get_token(token_id).await?.is_none() {
        return Err(ApiError::NotFound("token not found".to_string()));
    }
    state
        .metadata
        .revoke_token(token_id, OffsetDateTime::now_utc())
        .await?;

    tracing::info!(trace_id = %ctx.trace_id, actor = %ctx.actor, token_id = %token_id, "Token revoked");
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct ListEscalationsQuery {
    /// Only unacknowledged escalations (default true).
    pub open: Option<bool>,
}

/// GET /v1/admin/escalations - Failures waiting for a human.
pub async fn list_escalations(
    State(state): State<AppState>,
    Query(query): Query<ListEscalationsQuery>,
    req: Request,
) -> ApiResult<Json<Vec<EscalationView>>> {
    require_auth(&req)?.require_scope(TokenScope::FleetAdmin)?;
    let escalations = state
        .fleet
        .tracker
        .list_escalations(query.open.unwrap_or(true))
        .await?;
    Ok(Json(escalations))
}

#[derive(Debug, Deserialize)]
pub struct AcknowledgeRequest {
    pub note: String,
}

/// POST /v1/admin/escalations/{escalation_id}/acknowledge
pub async fn acknowledge_escalation(
    State(state): State<AppState>,
    Path(escalation_id): Path<String>,
    req: Request,
) -> ApiResult<Json<EscalationView>> {
    let (ctx, auth) = RequestContext::from_request(&req)?;
    auth.require_scope(TokenScope::FleetAdmin)?;

    let escalation_id = parse_uuid(&escalation_id, "escalation ID")?;
    let body: AcknowledgeRequest = read_json(req, MAX_ADMIN_BODY_SIZE).await?;
    let view = state
        .fleet
        .tracker
        .acknowledge(&ctx, escalation_id, &body.note)
        .await?;
    Ok(Json(view))
}
