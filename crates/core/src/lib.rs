//! Core domain types for the otter fleet update system.
//!
//! This crate defines the data model shared by the control plane and the
//! edge agent:
//! - Semantic versions and compatibility ranges
//! - The release manifest document and its validation
//! - Update and manifest state machines
//! - Allow-listed migration commands
//! - Command/progress messages and topic names
//! - Token scopes and configuration

pub mod config;
pub mod error;
pub mod gateway;
pub mod hash;
pub mod manifest;
pub mod migration;
pub mod state;
pub mod token;
pub mod transport;
pub mod update;
pub mod version;

pub use error::{Error, Result};
pub use gateway::GatewayId;
pub use hash::ContentHash;
pub use manifest::{ConfigAction, ConfigChange, ManifestDocument};
pub use migration::{MigrationCommand, Program};
pub use state::{ManifestStatus, UpdateState};
pub use token::{Token, TokenId, TokenScope};
pub use transport::{CommandKind, CommandMessage};
pub use update::{CheckQuery, FailureKind, ProgressMessage, ProgressReport, TerminalReport, UpdateId};
pub use version::{CompatibilityRange, SemVersion, is_compatible};
