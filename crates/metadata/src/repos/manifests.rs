//! Manifest repository.

use crate::error::MetadataResult;
use crate::models::{ManifestCounts, ManifestRow};
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

/// Signed artifact locations recorded on publish.
#[derive(Debug, Clone)]
pub struct PublishedArtifacts {
    pub content_hash: String,
    pub signature_hex: String,
    pub manifest_url: String,
    pub signature_url: String,
}

/// Repository for manifest operations.
#[async_trait]
pub trait ManifestRepo: Send + Sync {
    /// Insert a manifest. Fails with `AlreadyExists` if the version is taken.
    async fn create_manifest(&self, manifest: &ManifestRow) -> MetadataResult<()>;

    /// Get a manifest by ID.
    async fn get_manifest(&self, manifest_id: Uuid) -> MetadataResult<Option<ManifestRow>>;

    /// Get a manifest by exact version string.
    async fn get_manifest_by_version(&self, version: &str) -> MetadataResult<Option<ManifestRow>>;

    /// Get a published manifest by the hash of its document.
    async fn get_manifest_by_content_hash(
        &self,
        content_hash: &str,
    ) -> MetadataResult<Option<ManifestRow>>;

    /// List all manifests (unordered; callers sort by semantic version).
    async fn list_manifests(&self) -> MetadataResult<Vec<ManifestRow>>;

    /// Record signature and artifact URLs. Publishing twice keeps the first
    /// artifacts and returns false.
    async fn publish_manifest(
        &self,
        manifest_id: Uuid,
        artifacts: &PublishedArtifacts,
        published_at: OffsetDateTime,
    ) -> MetadataResult<bool>;

    /// Compare-and-swap the manifest status. Returns false if the current
    /// status is not `expected`.
    async fn update_manifest_status(
        &self,
        manifest_id: Uuid,
        expected: &str,
        status: &str,
        updated_at: OffsetDateTime,
    ) -> MetadataResult<bool>;

    /// Raise the recorded rollout percentage (never lowers it).
    async fn raise_rollout_percentage(
        &self,
        manifest_id: Uuid,
        percentage: i64,
        updated_at: OffsetDateTime,
    ) -> MetadataResult<()>;

    /// Recompute total/updated/failed from gateway update rows and store them.
    async fn recount_manifest(&self, manifest_id: Uuid) -> MetadataResult<ManifestCounts>;

    /// Move `rolling_out` to `completed` if every dispatched gateway is
    /// terminal. Returns true only for the call that made the change.
    async fn complete_manifest_if_done(
        &self,
        manifest_id: Uuid,
        completed_at: OffsetDateTime,
    ) -> MetadataResult<bool>;
}
