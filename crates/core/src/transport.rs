//! Command messages and pub/sub topic naming.

use crate::gateway::GatewayId;
use crate::update::UpdateId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// What the control plane asks a gateway to do.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandKind {
    Update,
    Rollback,
}

impl CommandKind {
    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "update" => Ok(Self::Update),
            "rollback" => Ok(Self::Rollback),
            _ => Err(crate::Error::Serialization(format!("unknown command: {s}"))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Update => "update",
            Self::Rollback => "rollback",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Command published on `gateways/{id}/commands` and returned by
/// `GET /updates/check`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandMessage {
    pub command: CommandKind,
    pub version: String,
    pub manifest_url: String,
    pub signature_url: String,
    pub update_id: UpdateId,
}

/// Topic carrying commands for one gateway.
pub fn commands_topic(gateway_id: &GatewayId) -> String {
    format!("gateways/{gateway_id}/commands")
}

/// Topic carrying progress events from one gateway.
pub fn progress_topic(gateway_id: &GatewayId) -> String {
    format!("gateways/{gateway_id}/progress")
}

/// Recover the gateway id from a progress topic name.
pub fn gateway_from_progress_topic(topic: &str) -> Option<GatewayId> {
    let id = topic.strip_prefix("gateways/")?.strip_suffix("/progress")?;
    GatewayId::parse(id).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_wire_shape() {
        let update_id = UpdateId::new();
        let msg = CommandMessage {
            command: CommandKind::Rollback,
            version: "2.1.0".to_string(),
            manifest_url: "https://fleet/m.json".to_string(),
            signature_url: "https://fleet/m.sig".to_string(),
            update_id,
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["command"], "rollback");
        assert_eq!(value["update_id"], update_id.to_string());
        let back: CommandMessage = serde_json::from_value(value).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_topics() {
        let gw = GatewayId::parse("gw-7").unwrap();
        assert_eq!(commands_topic(&gw), "gateways/gw-7/commands");
        assert_eq!(progress_topic(&gw), "gateways/gw-7/progress");
        assert_eq!(gateway_from_progress_topic("gateways/gw-7/progress"), Some(gw));
        assert_eq!(gateway_from_progress_topic("gateways/gw-7/commands"), None);
        assert_eq!(gateway_from_progress_topic("gateways/a/b/progress"), None);
    }
}
