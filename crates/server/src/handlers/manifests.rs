//! Manifest registry and rollout endpoints (operator scope).

use crate::context::RequestContext;
use crate::error::{ApiError, ApiResult};
use crate::handlers::common::{parse_uuid, read_json, rfc3339, rfc3339_opt};
use crate::jobs::{Job, JobOutput};
use crate::orchestrator::{RollbackReport, RolloutReport};
use crate::state::AppState;
use crate::tracker::{GatewayUpdateView, RolloutStatus};
use axum::Json;
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use otter_core::token::TokenScope;
use otter_core::{GatewayId, ManifestDocument, ManifestStatus};
use otter_metadata::models::ManifestRow;
use serde::{Deserialize, Serialize};

/// Manifest as returned by the API.
#[derive(Debug, Serialize)]
pub struct ManifestView {
    pub manifest_id: String,
    pub version: String,
    pub description: String,
    pub status: String,
    pub critical: bool,
    pub rollback_safe: bool,
    pub requires_reboot: bool,
    pub min_gateway_version: String,
    pub max_gateway_version: String,
    pub content_hash: Option<String>,
    pub manifest_url: Option<String>,
    pub signature_url: Option<String>,
    pub rollout_percentage: i64,
    pub total_count: i64,
    pub updated_count: i64,
    pub failed_count: i64,
    pub created_at: String,
    pub published_at: Option<String>,
    pub completed_at: Option<String>,
    pub document: serde_json::Value,
}

impl ManifestView {
    pub fn from_row(row: ManifestRow) -> ApiResult<Self> {
        let document = serde_json::from_str(&row.document)
            .map_err(|e| ApiError::Internal(format!("stored manifest is not JSON: {e}")))?;
        Ok(Self {
            manifest_id: row.manifest_id.to_string(),
            created_at: rfc3339(row.created_at)?,
            published_at: rfc3339_opt(row.published_at)?,
            completed_at: rfc3339_opt(row.completed_at)?,
            version: row.version,
            description: row.description,
            status: row.status,
            critical: row.critical,
            rollback_safe: row.rollback_safe,
            requires_reboot: row.requires_reboot,
            min_gateway_version: row.min_gateway_version,
            max_gateway_version: row.max_gateway_version,
            content_hash: row.content_hash,
            manifest_url: row.manifest_url,
            signature_url: row.signature_url,
            rollout_percentage: row.rollout_percentage,
            total_count: row.total_count,
            updated_count: row.updated_count,
            failed_count: row.failed_count,
            document,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct CreateManifestResponse {
    #[serde(flatten)]
    pub manifest: ManifestView,
    /// Entries agents will refuse to run (non-allow-listed commands).
    pub warnings: Vec<String>,
}

/// POST /v1/manifests - Author a draft manifest.
pub async fn create_manifest(
    State(state): State<AppState>,
    req: Request,
) -> ApiResult<(StatusCode, Json<CreateManifestResponse>)> {
    let (ctx, auth) = RequestContext::from_request(&req)?;
    auth.require_scope(TokenScope::FleetAdmin)?;

    let document: ManifestDocument = read_json(req, state.config.server.max_body_bytes).await?;
    let (row, warnings) = state.fleet.registry.create(&ctx, document).await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateManifestResponse {
            manifest: ManifestView::from_row(row)?,
            warnings,
        }),
    ))
}

/// GET /v1/manifests - All manifests, newest version first.
pub async fn list_manifests(
    State(state): State<AppState>,
    req: Request,
) -> ApiResult<Json<Vec<ManifestView>>> {
    let (_, auth) = RequestContext::from_request(&req)?;
    auth.require_scope(TokenScope::FleetAdmin)?;

    let rows = state.fleet.registry.list().await?;
    let views = rows
        .into_iter()
        .map(ManifestView::from_row)
        .collect::<ApiResult<Vec<_>>>()?;
    Ok(Json(views))
}

/// GET /v1/manifests/{manifest_id}
pub async fn get_manifest(
    State(state): State<AppState>,
    Path(manifest_id): Path<String>,
    req: Request,
) -> ApiResult<Json<ManifestView>> {
    let (_, auth) = RequestContext::from_request(&req)?;
    auth.require_scope(TokenScope::FleetAdmin)?;

    let manifest_id = parse_uuid(&manifest_id, "manifest ID")?;
    let row = state.fleet.registry.get(manifest_id).await?;
    Ok(Json(ManifestView::from_row(row)?))
}

/// POST /v1/manifests/{manifest_id}/publish - Sign and publish.
pub async fn publish_manifest(
    State(state): State<AppState>,
    Path(manifest_id): Path<String>,
    req: Request,
) -> ApiResult<Json<ManifestView>> {
    let (ctx, auth) = RequestContext::from_request(&req)?;
    auth.require_scope(TokenScope::FleetAdmin)?;

    let manifest_id = parse_uuid(&manifest_id, "manifest ID")?;
    let row = state.fleet.registry.publish(&ctx, manifest_id).await?;
    Ok(Json(ManifestView::from_row(row)?))
}

#[derive(Debug, Deserialize)]
pub struct PromoteRequest {
    pub status: String,
}

/// POST /v1/manifests/{manifest_id}/promote - Advance the lifecycle status.
pub async fn promote_manifest(
    State(state): State<AppState>,
    Path(manifest_id): Path<String>,
    req: Request,
) -> ApiResult<Json<ManifestView>> {
    let (ctx, auth) = RequestContext::from_request(&req)?;
    auth.require_scope(TokenScope::FleetAdmin)?;

    let manifest_id = parse_uuid(&manifest_id, "manifest ID")?;
    let body: PromoteRequest = read_json(req, state.config.server.max_body_bytes).await?;
    let to = ManifestStatus::parse(&body.status)
        .map_err(|_| ApiError::BadRequest(format!("unknown status: {}", body.status)))?;

    let row = state.fleet.registry.promote(&ctx, manifest_id, to).await?;
    Ok(Json(ManifestView::from_row(row)?))
}

#[derive(Debug, Deserialize)]
pub struct RolloutRequest {
    pub targets: Vec<String>,
    pub percentage: u8,
}

/// POST /v1/manifests/{manifest_id}/rollout - Dispatch to a share of targets.
pub async fn rollout_manifest(
    State(state): State<AppState>,
    Path(manifest_id): Path<String>,
    req: Request,
) -> ApiResult<Json<RolloutReport>> {
    let (ctx, auth) = RequestContext::from_request(&req)?;
    auth.require_scope(TokenScope::FleetAdmin)?;

    let manifest_id = parse_uuid(&manifest_id, "manifest ID")?;
    let body: RolloutRequest = read_json(req, state.config.server.max_body_bytes).await?;
    let targets = body
        .targets
        .iter()
        .map(|t| GatewayId::parse(t))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let job = Job::Rollout {
        manifest_id,
        targets,
        percentage: body.percentage,
    };
    match state.jobs.submit(ctx, job).await? {
        JobOutput::Rollout(report) => Ok(Json(report)),
        other => Err(ApiError::Internal(format!(
            "unexpected rollout job output: {other:?}"
        ))),
    }
}

/// POST /v1/manifests/{manifest_id}/rollback - Halt and roll back.
pub async fn rollback_manifest(
    State(state): State<AppState>,
    Path(manifest_id): Path<String>,
    req: Request,
) -> ApiResult<Json<RollbackReport>> {
    let (ctx, auth) = RequestContext::from_request(&req)?;
    auth.require_scope(TokenScope::FleetAdmin)?;

    let manifest_id = parse_uuid(&manifest_id, "manifest ID")?;
    let report = state
        .fleet
        .orchestrator
        .rollback(&ctx, manifest_id)
        .await?;
    Ok(Json(report))
}

/// POST /v1/manifests/{manifest_id}/complete - Recount and close the
/// rollout if every dispatched gateway is done.
pub async fn complete_manifest(
    State(state): State<AppState>,
    Path(manifest_id): Path<String>,
    req: Request,
) -> ApiResult<Json<RolloutStatus>> {
    let (ctx, auth) = RequestContext::from_request(&req)?;
    auth.require_scope(TokenScope::FleetAdmin)?;

    let manifest_id = parse_uuid(&manifest_id, "manifest ID")?;
    state
        .fleet
        .orchestrator
        .complete(&ctx, manifest_id)
        .await?;
    Ok(Json(
        state.fleet.tracker.rollout_status(manifest_id).await?,
    ))
}

/// GET /v1/manifests/{manifest_id}/status - Aggregate and per-gateway progress.
pub async fn manifest_status(
    State(state): State<AppState>,
    Path(manifest_id): Path<String>,
    req: Request,
) -> ApiResult<Json<RolloutStatus>> {
    let (_, auth) = RequestContext::from_request(&req)?;
    auth.require_scope(TokenScope::FleetAdmin)?;

    let manifest_id = parse_uuid(&manifest_id, "manifest ID")?;
    Ok(Json(
        state.fleet.tracker.rollout_status(manifest_id).await?,
    ))
}

/// GET /v1/gateways/{gateway_id}/updates - One gateway's update history.
pub async fn gateway_updates(
    State(state): State<AppState>,
    Path(gateway_id): Path<String>,
    req: Request,
) -> ApiResult<Json<Vec<GatewayUpdateView>>> {
    let (_, auth) = RequestContext::from_request(&req)?;
    auth.require_scope(TokenScope::FleetAdmin)?;

    let gateway = GatewayId::parse(&gateway_id).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    Ok(Json(state.fleet.tracker.gateway_history(&gateway).await?))
}
