//! Agent error types.

use otter_core::FailureKind;
use thiserror::Error;

/// Update agent errors, one variant per pipeline stage.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("update already in progress")]
    Busy,

    #[error("already at version {0}")]
    AlreadyCurrent(String),

    #[error("download failed: {0}")]
    Download(String),

    #[error("verification failed: {0}")]
    Verification(String),

    #[error("version {current} is outside the supported range {min}..={max}")]
    Incompatible {
        current: String,
        min: String,
        max: String,
    },

    #[error("backup failed: {0}")]
    Backup(String),

    #[error("apply failed: {0}")]
    Apply(String),

    #[error("health check failed: {0}")]
    HealthCheck(String),

    /// The automatic restore did not bring the gateway back. Never retried.
    #[error("CRITICAL: restore failed: {0}")]
    Restore(String),

    #[error("no backup bundle available")]
    NoBackup,

    #[error("command failed: {0}")]
    Runtime(String),

    #[error("API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("command channel error: {0}")]
    Channel(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Core(#[from] otter_core::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    /// Error kind carried in the failure report.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Download(_) | Self::Http(_) => FailureKind::Download,
            Self::Verification(_) => FailureKind::Verification,
            Self::Backup(_) => FailureKind::Backup,
            Self::Apply(_) | Self::Runtime(_) => FailureKind::Apply,
            Self::HealthCheck(_) => FailureKind::HealthCheck,
            Self::Restore(_) => FailureKind::RestoreFailed,
            _ => FailureKind::Other,
        }
    }

    /// Errors raised by apply or health check, which trigger a restore.
    pub fn needs_restore(&self) -> bool {
        matches!(
            self,
            Self::Apply(_) | Self::HealthCheck(_) | Self::Runtime(_)
        )
    }
}

/// Result type for agent operations.
pub type AgentResult<T> = std::result::Result<T, AgentError>;
