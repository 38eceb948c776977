//! Published manifest and signature documents.

use crate::error::{ApiError, ApiResult};
use crate::registry::ArtifactKind;
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};

/// GET /v1/artifacts/{content_hash}/{file}
///
/// Unauthenticated: documents are content-addressed and agents verify the
/// signature themselves. Bytes are served exactly as signed.
pub async fn get_artifact(
    State(state): State<AppState>,
    Path((content_hash, file)): Path<(String, String)>,
) -> ApiResult<Response> {
    let kind = ArtifactKind::from_file_name(&file)
        .ok_or_else(|| ApiError::NotFound(format!("unknown artifact: {file}")))?;
    let bytes = state.fleet.registry.artifact(&content_hash, kind).await?;

    Ok((
        [
            (header::CONTENT_TYPE, kind.content_type()),
            (header::CACHE_CONTROL, "public, max-age=31536000, immutable"),
        ],
        bytes,
    )
        .into_response())
}
