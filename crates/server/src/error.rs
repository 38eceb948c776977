//! Control plane and API error types.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use otter_core::UpdateState;
use otter_metadata::MetadataError;
use serde::Serialize;

/// Errors raised by the registry, orchestrator and tracker.
#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error("manifest version already exists: {0}")]
    DuplicateVersion(String),

    #[error("invalid version: {0}")]
    InvalidVersion(String),

    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("illegal state transition: {from} -> {to}")]
    StateTransition { from: UpdateState, to: UpdateState },

    #[error("illegal manifest status change: {0}")]
    StatusTransition(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("manifest {0} is not published")]
    NotPublished(String),

    #[error("manifest {version} does not accept rollouts while {status}")]
    RolloutClosed { version: String, status: String },

    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("update {update_id} does not belong to gateway {gateway_id}")]
    GatewayMismatch {
        update_id: String,
        gateway_id: String,
    },

    #[error("no signing key configured")]
    SigningUnavailable,

    #[error("bus error: {0}")]
    Bus(String),

    #[error("notification failed: {0}")]
    Notify(String),

    #[error("job queue is closed")]
    QueueClosed,

    #[error("job aborted: {0}")]
    JobAborted(String),

    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("signer error: {0}")]
    Signer(#[from] otter_signer::SignerError),

    #[error("core error: {0}")]
    Core(otter_core::Error),
}

impl From<otter_core::Error> for FleetError {
    fn from(err: otter_core::Error) -> Self {
        use otter_core::Error as E;
        match err {
            E::InvalidVersion(v) | E::InvalidRange(v) => Self::InvalidVersion(v),
            E::InvalidManifest(m) => Self::InvalidManifest(m),
            E::StateTransition { from, to } => Self::StateTransition { from, to },
            E::StatusTransition { from, to } => Self::StatusTransition(format!("{from} -> {to}")),
            other => Self::Core(other),
        }
    }
}

impl FleetError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::DuplicateVersion(_) => "duplicate_version",
            Self::InvalidVersion(_) => "invalid_version",
            Self::InvalidManifest(_) => "invalid_manifest",
            Self::InvalidRequest(_) => "bad_request",
            Self::StateTransition { .. } => "state_transition",
            Self::StatusTransition(_) => "status_transition",
            Self::NotFound(_) => "not_found",
            Self::NotPublished(_) => "not_published",
            Self::RolloutClosed { .. } => "rollout_closed",
            Self::Precondition(_) => "precondition_failed",
            Self::GatewayMismatch { .. } => "forbidden",
            Self::SigningUnavailable => "signing_unavailable",
            Self::Bus(_) => "bus_error",
            Self::Notify(_) => "notify_error",
            Self::QueueClosed => "queue_closed",
            Self::JobAborted(_) => "job_aborted",
            Self::Metadata(MetadataError::NotFound(_)) => "not_found",
            Self::Metadata(_) => "metadata_error",
            Self::Signer(_) => "signer_error",
            Self::Core(_) => "core_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::DuplicateVersion(_) => StatusCode::CONFLICT,
            Self::InvalidVersion(_) | Self::InvalidManifest(_) | Self::InvalidRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::StateTransition { .. } | Self::StatusTransition(_) => StatusCode::CONFLICT,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::NotPublished(_) | Self::RolloutClosed { .. } | Self::Precondition(_) => {
                StatusCode::CONFLICT
            }
            Self::GatewayMismatch { .. } => StatusCode::FORBIDDEN,
            Self::SigningUnavailable | Self::QueueClosed => StatusCode::SERVICE_UNAVAILABLE,
            Self::Bus(_) | Self::Notify(_) | Self::Signer(_) | Self::JobAborted(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::Metadata(e) => match e {
                MetadataError::NotFound(_) => StatusCode::NOT_FOUND,
                MetadataError::AlreadyExists(_) | MetadataError::Constraint(_) => {
                    StatusCode::CONFLICT
                }
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Core(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// Whether the job queue should retry the operation.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Metadata(e) if e.is_transient())
    }
}

/// Result type for control plane operations.
pub type FleetResult<T> = std::result::Result<T, FleetError>;

/// API error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error code for programmatic handling.
    pub code: String,
    /// Human-readable error message.
    pub message: String,
}

/// API error type.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Fleet(#[from] FleetError),

    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("core error: {0}")]
    Core(#[from] otter_core::Error),
}

impl ApiError {
    /// Get the error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::BadRequest(_) => "bad_request",
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::Conflict(_) => "conflict",
            Self::Internal(_) => "internal_error",
            Self::Fleet(e) => e.code(),
            Self::Metadata(MetadataError::NotFound(_)) => "not_found",
            Self::Metadata(_) => "metadata_error",
            Self::Core(otter_core::Error::InvalidVersion(_)) => "invalid_version",
            Self::Core(_) => "bad_request",
        }
    }

    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Fleet(e) => e.status_code(),
            Self::Metadata(e) => match e {
                MetadataError::NotFound(_) => StatusCode::NOT_FOUND,
                MetadataError::AlreadyExists(_) | MetadataError::Constraint(_) => {
                    StatusCode::CONFLICT
                }
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Core(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, code = self.code(), "Request failed");
        }
        let body = ErrorResponse {
            code: self.code().to_string(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;
