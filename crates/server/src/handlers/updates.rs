//! Gateway-facing REST endpoints: polling and progress reporting.
//!
//! Mirrors the bus topics for gateways that cannot keep a subscription open.

use crate::context::RequestContext;
use crate::error::{ApiError, ApiResult};
use crate::handlers::common::read_json;
use crate::jobs::{Job, JobOutput};
use crate::state::AppState;
use crate::tracker::{ProgressOutcome, TerminalEvent};
use axum::Json;
use axum::extract::{Query, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use otter_core::{CheckQuery, ProgressReport, TerminalReport, UpdateState};

/// Progress and outcome bodies are small; logs are one line per event.
const MAX_REPORT_BODY_SIZE: usize = 256 * 1024;

/// GET /updates/check - Next command for a gateway.
///
/// Returns 200 with a command, or 204 when there is nothing to do.
pub async fn check_updates(
    State(state): State<AppState>,
    Query(query): Query<CheckQuery>,
    req: Request,
) -> ApiResult<Response> {
    let (_, auth) = RequestContext::from_request(&req)?;
    auth.require_gateway(&query.gateway_id)?;

    let command = state
        .fleet
        .orchestrator
        .check(&query.gateway_id, &query.current_version)
        .await?;
    Ok(match command {
        Some(command) => Json(command).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

async fn run_progress_job(state: &AppState, ctx: RequestContext, job: Job) -> ApiResult<Json<ProgressOutcome>> {
    match state.jobs.submit(ctx, job).await? {
        JobOutput::Progress(outcome) => Ok(Json(outcome)),
        other => Err(ApiError::Internal(format!(
            "unexpected progress job output: {other:?}"
        ))),
    }
}

/// POST /updates/progress - Report a pipeline step.
pub async fn report_progress(
    State(state): State<AppState>,
    req: Request,
) -> ApiResult<Json<ProgressOutcome>> {
    let (ctx, auth) = RequestContext::from_request(&req)?;
    let report: ProgressReport = read_json(req, MAX_REPORT_BODY_SIZE).await?;
    auth.require_gateway(&report.gateway_id)?;

    run_progress_job(&state, ctx, Job::Progress(report)).await
}

async fn report_terminal(
    state: AppState,
    req: Request,
    outcome: UpdateState,
) -> ApiResult<Json<ProgressOutcome>> {
    let (ctx, auth) = RequestContext::from_request(&req)?;
    let report: TerminalReport = read_json(req, MAX_REPORT_BODY_SIZE).await?;
    auth.require_gateway(&report.gateway_id)?;

    let event = TerminalEvent::from_report(report, outcome);
    run_progress_job(&state, ctx, Job::Terminal(event)).await
}

/// POST /updates/success - Report a successful update.
pub async fn report_success(
    State(state): State<AppState>,
    req: Request,
) -> ApiResult<Json<ProgressOutcome>> {
    report_terminal(state, req, UpdateState::Success).await
}

/// POST /updates/failure - Report a failed update.
pub async fn report_failure(
    State(state): State<AppState>,
    req: Request,
) -> ApiResult<Json<ProgressOutcome>> {
    report_terminal(state, req, UpdateState::Failed).await
}
