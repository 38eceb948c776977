//! Error types for the core domain.

use thiserror::Error;

use crate::state::UpdateState;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid version: {0}")]
    InvalidVersion(String),

    #[error("invalid compatibility range: {0}")]
    InvalidRange(String),

    #[error("invalid hash: {0}")]
    InvalidHash(String),

    #[error("invalid gateway id: {0}")]
    InvalidGatewayId(String),

    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("illegal state transition: {from} -> {to}")]
    StateTransition { from: UpdateState, to: UpdateState },

    #[error("illegal manifest status change: {from} -> {to}")]
    StatusTransition { from: String, to: String },

    #[error("command rejected: {0}")]
    CommandRejected(String),

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
