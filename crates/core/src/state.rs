//! Per-gateway update state machine and manifest lifecycle.

use serde::{Deserialize, Serialize};
use std::fmt;

/// State of one gateway's update to one manifest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateState {
    Pending,
    Downloading,
    Verifying,
    BackingUp,
    Applying,
    Success,
    Failed,
    RolledBack,
}

impl UpdateState {
    /// Every state, in pipeline order.
    pub const ALL: [UpdateState; 8] = [
        Self::Pending,
        Self::Downloading,
        Self::Verifying,
        Self::BackingUp,
        Self::Applying,
        Self::Success,
        Self::Failed,
        Self::RolledBack,
    ];

    /// Parse from the wire/database representation.
    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "downloading" => Ok(Self::Downloading),
            "verifying" => Ok(Self::Verifying),
            "backing_up" => Ok(Self::BackingUp),
            "applying" => Ok(Self::Applying),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "rolled_back" => Ok(Self::RolledBack),
            _ => Err(crate::Error::Serialization(format!(
                "unknown update state: {s}"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Verifying => "verifying",
            Self::BackingUp => "backing_up",
            Self::Applying => "applying",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::RolledBack => "rolled_back",
        }
    }

    /// Terminal states take no further automatic transition.
    ///
    /// `Failed` is terminal even though an explicit rollback may still move
    /// it to `RolledBack`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::RolledBack)
    }

    /// An in-flight update blocks dispatch of any other manifest.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Pipeline stages that may end in `Failed`.
    fn is_working(&self) -> bool {
        matches!(
            self,
            Self::Downloading | Self::Verifying | Self::BackingUp | Self::Applying
        )
    }

    /// Check an edge against the allowed-transitions table.
    pub fn can_transition(self, to: UpdateState, rollback_safe: bool) -> bool {
        use UpdateState::*;
        match (self, to) {
            (Pending, Downloading)
            | (Downloading, Verifying)
            | (Verifying, BackingUp)
            | (BackingUp, Applying)
            | (Applying, Success) => true,
            (from, Failed) => from.is_working(),
            (Failed, RolledBack) => rollback_safe,
            _ => false,
        }
    }

    /// Apply a transition, returning the new state or a
    /// [`crate::Error::StateTransition`] that leaves `self` untouched.
    pub fn transition(self, to: UpdateState, rollback_safe: bool) -> crate::Result<UpdateState> {
        if self.can_transition(to, rollback_safe) {
            Ok(to)
        } else {
            Err(crate::Error::StateTransition { from: self, to })
        }
    }
}

impl fmt::Display for UpdateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a manifest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManifestStatus {
    Draft,
    Testing,
    Staged,
    RollingOut,
    Completed,
    RolledBack,
}

impl ManifestStatus {
    pub fn parse(s: &str) -> crate::Result<Self> {
        match s {
            "draft" => Ok(Self::Draft),
            "testing" => Ok(Self::Testing),
            "staged" => Ok(Self::Staged),
            "rolling_out" => Ok(Self::RollingOut),
            "completed" => Ok(Self::Completed),
            "rolled_back" => Ok(Self::RolledBack),
            _ => Err(crate::Error::Serialization(format!(
                "unknown manifest status: {s}"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Testing => "testing",
            Self::Staged => "staged",
            Self::RollingOut => "rolling_out",
            Self::Completed => "completed",
            Self::RolledBack => "rolled_back",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Draft => 0,
            Self::Testing => 1,
            Self::Staged => 2,
            Self::RollingOut => 3,
            Self::Completed => 4,
            Self::RolledBack => 5,
        }
    }

    /// Move forward in the lifecycle. Staying put is allowed so that repeated
    /// requests are idempotent; `RolledBack` is only reachable via
    /// [`ManifestStatus::rollback`].
    pub fn advance(self, to: ManifestStatus) -> crate::Result<ManifestStatus> {
        let ok = to != Self::RolledBack && self != Self::RolledBack && to.rank() >= self.rank();
        if ok {
            Ok(to)
        } else {
            Err(self.illegal(to))
        }
    }

    /// Operator-triggered rollback. Drafts were never dispatched and cannot be
    /// rolled back.
    pub fn rollback(self) -> crate::Result<ManifestStatus> {
        match self {
            Self::Draft | Self::RolledBack => Err(self.illegal(Self::RolledBack)),
            _ => Ok(Self::RolledBack),
        }
    }

    /// Whether new gateways may be dispatched this manifest.
    pub fn accepts_rollout(&self) -> bool {
        matches!(self, Self::Testing | Self::Staged | Self::RollingOut)
    }

    fn illegal(self, to: ManifestStatus) -> crate::Error {
        crate::Error::StatusTransition {
            from: self.as_str().to_string(),
            to: to.as_str().to_string(),
        }
    }
}

impl fmt::Display for ManifestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
