//! Gateway backup reference repository.

use crate::error::MetadataResult;
use crate::models::GatewayBackupRow;
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

/// Repository for backup references.
#[async_trait]
pub trait BackupRepo: Send + Sync {
    /// Record a backup for (gateway, manifest). Idempotent; returns false if
    /// the row already existed.
    async fn create_backup(&self, backup: &GatewayBackupRow) -> MetadataResult<bool>;

    /// Get the backup for (gateway, manifest).
    async fn get_backup(
        &self,
        gateway_id: &str,
        manifest_id: Uuid,
    ) -> MetadataResult<Option<GatewayBackupRow>>;

    /// Mark a backup as confirmed writable, storing the agent's bundle path.
    async fn confirm_backup(
        &self,
        gateway_id: &str,
        manifest_id: Uuid,
        bundle_path: Option<&str>,
        confirmed_at: OffsetDateTime,
    ) -> MetadataResult<bool>;

    /// Delete backups whose retention deadline has passed.
    async fn purge_expired_backups(&self, now: OffsetDateTime) -> MetadataResult<u64>;
}
