//! Per-gateway update identifiers and progress/terminal reports.

use crate::gateway::GatewayId;
use crate::state::UpdateState;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Correlates every command and event that belongs to one gateway's update.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UpdateId(Uuid);

impl UpdateId {
    /// Generate a new random update ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse from a string.
    pub fn parse(s: &str) -> crate::Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| crate::Error::Serialization(format!("invalid update ID: {e}")))
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for UpdateId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for UpdateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UpdateId({})", self.0)
    }
}

impl fmt::Display for UpdateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Progress event published by an agent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressMessage {
    pub update_id: UpdateId,
    pub state: UpdateState,
    pub progress_percentage: u8,
    #[serde(default)]
    pub current_step: String,
    #[serde(default)]
    pub log: String,
    /// Local bundle path, sent when entering `applying`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_path: Option<String>,
}

impl ProgressMessage {
    pub fn new(update_id: UpdateId, state: UpdateState, progress_percentage: u8) -> Self {
        Self {
            update_id,
            state,
            progress_percentage: progress_percentage.min(100),
            current_step: state.as_str().to_string(),
            log: String::new(),
            backup_path: None,
        }
    }

    pub fn with_log(mut self, log: impl Into<String>) -> Self {
        self.log = log.into();
        self
    }

    pub fn with_backup_path(mut self, path: impl Into<String>) -> Self {
        self.backup_path = Some(path.into());
        self
    }
}

/// REST mirror of a progress event (`POST /updates/progress`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressReport {
    pub gateway_id: GatewayId,
    #[serde(flatten)]
    pub message: ProgressMessage,
}

/// Why an agent gave up on an update.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Download,
    Verification,
    Backup,
    Apply,
    HealthCheck,
    /// Automatic restore failed; needs a human.
    RestoreFailed,
    /// The control plane gave up waiting in `applying`.
    ApplyTimeout,
    Other,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Download => "download",
            Self::Verification => "verification",
            Self::Backup => "backup",
            Self::Apply => "apply",
            Self::HealthCheck => "health_check",
            Self::RestoreFailed => "restore_failed",
            Self::ApplyTimeout => "apply_timeout",
            Self::Other => "other",
        }
    }

    /// Critical failures are escalated and never auto-remediated.
    pub fn is_critical(&self) -> bool {
        matches!(self, Self::RestoreFailed)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body of `POST /updates/success` and `POST /updates/failure`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalReport {
    pub gateway_id: GatewayId,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_id: Option<UpdateId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<FailureKind>,
    /// Extra line appended to the row's log.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<String>,
}

/// Query of `GET /updates/check`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckQuery {
    pub gateway_id: GatewayId,
    pub current_version: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_message_wire_shape() {
        let id = UpdateId::parse("5b1f0c4e-8f6b-4f7e-9a55-2d7b9d9c1a10").unwrap();
        let msg = ProgressMessage::new(id, UpdateState::BackingUp, 40).with_log("snapshot");
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "update_id": "5b1f0c4e-8f6b-4f7e-9a55-2d7b9d9c1a10",
                "state": "backing_up",
                "progress_percentage": 40,
                "current_step": "backing_up",
                "log": "snapshot"
            })
        );
    }

    #[test]
    fn test_percentage_clamped() {
        let msg = ProgressMessage::new(UpdateId::new(), UpdateState::Applying, 250);
        assert_eq!(msg.progress_percentage, 100);
    }

    #[test]
    fn test_progress_report_flattens_message() {
        let json = r#"{
            "gateway_id": "gw-1",
            "update_id": "5b1f0c4e-8f6b-4f7e-9a55-2d7b9d9c1a10",
            "state": "downloading",
            "progress_percentage": 10
        }"#;
        let report: ProgressReport = serde_json::from_str(json).unwrap();
        assert_eq!(report.gateway_id.as_str(), "gw-1");
        assert_eq!(report.message.state, UpdateState::Downloading);
        assert!(report.message.log.is_empty());
    }

    #[test]
    fn test_terminal_report_optional_fields() {
        let report: TerminalReport =
            serde_json::from_str(r#"{"gateway_id":"gw-1","version":"1.5.0"}"#).unwrap();
        assert!(report.update_id.is_none() && report.error.is_none());

        let report: TerminalReport = serde_json::from_str(
            r#"{"gateway_id":"gw-1","version":"1.5.0","error":"disk full","error_kind":"restore_failed"}"#,
        )
        .unwrap();
        assert!(report.error_kind.unwrap().is_critical());
    }
}
