//! Escalation repository.

use crate::error::MetadataResult;
use crate::models::EscalationRow;
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

/// Repository for human-actionable failures.
#[async_trait]
pub trait EscalationRepo: Send + Sync {
    /// Open an escalation. Returns false if one already exists for the update.
    async fn create_escalation(&self, escalation: &EscalationRow) -> MetadataResult<bool>;

    /// Get an escalation by ID.
    async fn get_escalation(&self, escalation_id: Uuid) -> MetadataResult<Option<EscalationRow>>;

    /// List escalations, newest first.
    async fn list_escalations(&self, open_only: bool) -> MetadataResult<Vec<EscalationRow>>;

    /// Acknowledge an open escalation. Returns false if already acknowledged.
    async fn acknowledge_escalation(
        &self,
        escalation_id: Uuid,
        acknowledged_by: &str,
        note: &str,
        acknowledged_at: OffsetDateTime,
    ) -> MetadataResult<bool>;
}
