//! Otter edge update agent.
//!
//! Runs on each gateway. Given a command from the control plane it downloads
//! the release manifest, verifies its signature against the pinned key,
//! snapshots the current deployment, applies the release and health-checks
//! it, restoring the snapshot on failure.

pub mod api_client;
pub mod apply;
pub mod backup;
pub mod channel;
pub mod descriptor;
pub mod error;
pub mod health;
pub mod lock;
pub mod pipeline;
pub mod poll;
pub mod reporter;
pub mod runtime;
pub mod version_file;

pub use api_client::ApiClient;
pub use backup::{BackupStore, Bundle, BundleMetadata};
pub use error::{AgentError, AgentResult};
pub use pipeline::{Agent, CommandOutcome, UpdateOutcome};
pub use channel::GatewayChannel;
pub use reporter::{ChannelReporter, Reporter};
pub use runtime::{DockerCompose, ServiceRuntime};
