//! Gateway update repository.
//!
//! Every state change goes through a compare-and-swap on the row's current
//! state, so two racing events for one gateway cannot both apply.

use crate::error::MetadataResult;
use crate::models::{DispatchSlot, GatewayUpdateRow, ProgressChange, TerminalChange};
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

/// Repository for per-gateway update rows.
#[async_trait]
pub trait GatewayUpdateRepo: Send + Sync {
    /// Get-or-create the row for (gateway, manifest). A gateway with an
    /// in-flight update for a different manifest is reported as blocked.
    async fn dispatch_update(&self, row: &GatewayUpdateRow) -> MetadataResult<DispatchSlot>;

    /// Get a row by update ID.
    async fn get_update(&self, update_id: Uuid) -> MetadataResult<Option<GatewayUpdateRow>>;

    /// Get the row for (gateway, manifest).
    async fn get_update_for(
        &self,
        gateway_id: &str,
        manifest_id: Uuid,
    ) -> MetadataResult<Option<GatewayUpdateRow>>;

    /// Get the gateway's non-terminal row, if any.
    async fn get_active_update(&self, gateway_id: &str)
    -> MetadataResult<Option<GatewayUpdateRow>>;

    /// Most recent row for a gateway and release version.
    async fn find_update_by_version(
        &self,
        gateway_id: &str,
        version: &str,
    ) -> MetadataResult<Option<GatewayUpdateRow>>;

    /// List rows for a manifest ordered by gateway id.
    async fn list_updates_for_manifest(
        &self,
        manifest_id: Uuid,
    ) -> MetadataResult<Vec<GatewayUpdateRow>>;

    /// List rows for a gateway, newest first.
    async fn list_updates_for_gateway(
        &self,
        gateway_id: &str,
    ) -> MetadataResult<Vec<GatewayUpdateRow>>;

    /// Apply a non-terminal progress event if the row is still in `expected`
    /// and the event's digest was never applied to it before. The digest is
    /// recorded in the same transaction.
    async fn apply_progress(
        &self,
        update_id: Uuid,
        expected: &str,
        change: &ProgressChange,
    ) -> MetadataResult<bool>;

    /// Whether a progress event with `digest` was already applied to the row.
    async fn has_event(&self, update_id: Uuid, digest: &str) -> MetadataResult<bool>;

    /// Apply a terminal outcome if the row is still in `expected`.
    async fn apply_terminal(
        &self,
        update_id: Uuid,
        expected: &str,
        change: &TerminalChange,
    ) -> MetadataResult<bool>;

    /// Stamp the first rollback request. Returns false if already stamped.
    async fn mark_rollback_requested(
        &self,
        update_id: Uuid,
        requested_at: OffsetDateTime,
    ) -> MetadataResult<bool>;

    /// Failed rows of a gateway with a rollback requested but not yet done.
    async fn list_pending_rollbacks(
        &self,
        gateway_id: &str,
    ) -> MetadataResult<Vec<GatewayUpdateRow>>;

    /// Rows that entered `applying` before `started_before`.
    async fn list_stale_applying(
        &self,
        started_before: OffsetDateTime,
    ) -> MetadataResult<Vec<GatewayUpdateRow>>;

    /// `pending` rows untouched since `idle_since` with retries left.
    async fn list_stale_pending(
        &self,
        idle_since: OffsetDateTime,
        max_retries: i64,
    ) -> MetadataResult<Vec<GatewayUpdateRow>>;

    /// Bump `retry_count` for a pending row that still has retries left.
    async fn record_redelivery(
        &self,
        update_id: Uuid,
        max_retries: i64,
        at: OffsetDateTime,
    ) -> MetadataResult<bool>;
}
