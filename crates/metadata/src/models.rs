//! Database models mapping to the metadata schema.

use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// Manifests
// =============================================================================

/// Release manifest record.
///
/// `document` holds the canonical JSON bytes that are signed on publish.
#[derive(Debug, Clone, FromRow)]
pub struct ManifestRow {
    pub manifest_id: Uuid,
    pub version: String,
    pub description: String,
    pub document: String,
    pub status: String,
    pub critical: bool,
    pub rollback_safe: bool,
    pub requires_reboot: bool,
    pub min_gateway_version: String,
    pub max_gateway_version: String,
    pub content_hash: Option<String>,
    pub signature_hex: Option<String>,
    pub manifest_url: Option<String>,
    pub signature_url: Option<String>,
    pub rollout_percentage: i64,
    pub total_count: i64,
    pub updated_count: i64,
    pub failed_count: i64,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub published_at: Option<OffsetDateTime>,
    pub completed_at: Option<OffsetDateTime>,
}

impl ManifestRow {
    /// Whether the manifest has been signed and has artifact URLs.
    pub fn is_published(&self) -> bool {
        self.manifest_url.is_some() && self.signature_url.is_some()
    }
}

/// Aggregate counters recomputed from gateway update rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ManifestCounts {
    pub total: i64,
    pub updated: i64,
    pub failed: i64,
}

impl ManifestCounts {
    /// Every dispatched gateway reached a terminal outcome.
    pub fn is_complete(&self) -> bool {
        self.total > 0 && self.updated + self.failed == self.total
    }

    /// Fraction of dispatched gateways that succeeded.
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.updated as f64 / self.total as f64
        }
    }
}

// =============================================================================
// Gateway updates
// =============================================================================

/// One gateway's update to one manifest.
#[derive(Debug, Clone, FromRow)]
pub struct GatewayUpdateRow {
    pub update_id: Uuid,
    pub gateway_id: String,
    pub manifest_id: Uuid,
    pub version: String,
    pub state: String,
    pub progress_percentage: i64,
    pub current_step: String,
    /// Newline separated, append-only.
    pub logs: String,
    /// Digest of the last applied event, for duplicate detection.
    pub last_event_digest: Option<String>,
    pub retry_count: i64,
    pub error: Option<String>,
    pub error_kind: Option<String>,
    pub dispatched_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub applying_started_at: Option<OffsetDateTime>,
    pub rollback_requested_at: Option<OffsetDateTime>,
    pub completed_at: Option<OffsetDateTime>,
    pub duration_ms: Option<i64>,
}

/// Result of trying to create a gateway update slot.
#[derive(Debug, Clone)]
pub enum DispatchSlot {
    /// A new pending row was inserted.
    Created(GatewayUpdateRow),
    /// A row for this gateway and manifest already exists.
    Existing(GatewayUpdateRow),
    /// The gateway has an in-flight update for another manifest.
    Blocked(GatewayUpdateRow),
}

/// A non-terminal progress event applied with compare-and-swap.
#[derive(Debug, Clone)]
pub struct ProgressChange {
    pub state: String,
    pub progress_percentage: i64,
    pub current_step: String,
    pub log_line: Option<String>,
    pub event_digest: String,
    pub applying_started_at: Option<OffsetDateTime>,
    pub at: OffsetDateTime,
}

/// A terminal outcome applied with compare-and-swap.
#[derive(Debug, Clone)]
pub struct TerminalChange {
    pub state: String,
    pub error: Option<String>,
    pub error_kind: Option<String>,
    pub log_line: Option<String>,
    pub event_digest: String,
    pub completed_at: OffsetDateTime,
    pub duration_ms: i64,
}

// =============================================================================
// Gateway backups
// =============================================================================

/// Control plane reference to a gateway-local backup bundle.
#[derive(Debug, Clone, FromRow)]
pub struct GatewayBackupRow {
    pub backup_id: Uuid,
    pub gateway_id: String,
    pub manifest_id: Uuid,
    pub update_id: Uuid,
    pub bundle_path: Option<String>,
    pub confirmed: bool,
    pub created_at: OffsetDateTime,
    pub confirmed_at: Option<OffsetDateTime>,
    pub retain_until: OffsetDateTime,
}

// =============================================================================
// Tokens
// =============================================================================

/// Token record.
#[derive(Debug, Clone, FromRow)]
pub struct TokenRow {
    pub token_id: Uuid,
    pub gateway_id: Option<String>,
    pub token_hash: String,
    pub scopes: String, // JSON array
    pub expires_at: Option<OffsetDateTime>,
    pub revoked_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub last_used_at: Option<OffsetDateTime>,
    pub description: Option<String>,
}

// =============================================================================
// Escalations
// =============================================================================

/// A failure that needs a human. Only closed by explicit acknowledgement.
#[derive(Debug, Clone, FromRow)]
pub struct EscalationRow {
    pub escalation_id: Uuid,
    pub gateway_id: String,
    pub manifest_id: Uuid,
    pub update_id: Uuid,
    pub severity: String,
    pub message: String,
    pub created_at: OffsetDateTime,
    pub acknowledged_at: Option<OffsetDateTime>,
    pub acknowledged_by: Option<String>,
    pub note: Option<String>,
}
