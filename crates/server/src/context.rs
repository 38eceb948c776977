//! Per-request context passed explicitly into fleet operations.

use crate::auth::{AuthenticatedUser, TraceId, require_auth};
use crate::error::ApiResult;
use axum::extract::Request;

/// Who is acting and under which trace id.
///
/// Built once per request (or per background job) and handed down through
/// call signatures so audit log lines carry the caller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestContext {
    pub trace_id: String,
    pub actor: String,
}

impl RequestContext {
    pub fn new(trace_id: impl Into<String>, actor: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
            actor: actor.into(),
        }
    }

    /// Context for work the control plane starts on its own.
    pub fn system(task: &str) -> Self {
        Self::new(TraceId::new().0, format!("system:{task}"))
    }

    /// Context for an authenticated HTTP request.
    pub fn for_user(trace_id: Option<&TraceId>, user: &AuthenticatedUser) -> Self {
        let trace_id = trace_id.cloned().unwrap_or_default();
        Self::new(trace_id.0, format!("token:{}", user.token.id))
    }

    /// Build from request extensions, requiring authentication.
    pub fn from_request(req: &Request) -> ApiResult<(Self, AuthenticatedUser)> {
        let user = require_auth(req)?.clone();
        let ctx = Self::for_user(req.extensions().get::<TraceId>(), &user);
        Ok((ctx, user))
    }
}
