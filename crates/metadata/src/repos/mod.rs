//! Repository traits for metadata operations.

pub mod backups;
pub mod bootstrap;
pub mod escalations;
pub mod manifests;
pub mod tokens;
pub mod updates;

pub use backups::BackupRepo;
pub use bootstrap::BootstrapRepo;
pub use escalations::EscalationRepo;
pub use manifests::{ManifestRepo, PublishedArtifacts};
pub use tokens::TokenRepo;
pub use updates::GatewayUpdateRepo;
