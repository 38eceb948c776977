//! Gateway identifiers.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

const MAX_GATEWAY_ID_LEN: usize = 128;

/// Identifier of an edge gateway.
///
/// Ids become part of pub/sub topic names, so they are restricted to
/// `[A-Za-z0-9._-]` and may not start with a dot.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct GatewayId(String);

impl GatewayId {
    pub fn parse(s: &str) -> crate::Result<Self> {
        if s.is_empty() || s.len() > MAX_GATEWAY_ID_LEN {
            return Err(crate::Error::InvalidGatewayId(format!(
                "length must be 1..={MAX_GATEWAY_ID_LEN}"
            )));
        }
        if s.starts_with('.') {
            return Err(crate::Error::InvalidGatewayId(format!(
                "{s:?} starts with '.'"
            )));
        }
        if let Some(bad) = s
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
        {
            return Err(crate::Error::InvalidGatewayId(format!(
                "{s:?} contains {bad:?}"
            )));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for GatewayId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

impl fmt::Debug for GatewayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GatewayId({})", self.0)
    }
}

impl fmt::Display for GatewayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
