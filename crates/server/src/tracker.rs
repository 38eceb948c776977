//! Progress tracking: applies agent events to the per-gateway state machine,
//! fires automatic rollback and escalates critical failures.

use crate::context::RequestContext;
use crate::error::{FleetError, FleetResult};
use crate::metrics;
use crate::notify::Notifier;
use crate::orchestrator::Orchestrator;
use otter_core::config::RolloutConfig;
use otter_core::{
    FailureKind, GatewayId, ManifestStatus, ProgressReport, TerminalReport, UpdateId, UpdateState,
};
use otter_metadata::MetadataStore;
use otter_metadata::models::{
    EscalationRow, GatewayBackupRow, GatewayUpdateRow, ManifestRow, ProgressChange, TerminalChange,
};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use time::OffsetDateTime;
use uuid::Uuid;

/// What happened to an incoming event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "result", content = "state", rename_all = "snake_case")]
pub enum ProgressOutcome {
    /// The row moved to (or was refreshed in) this state.
    Applied(UpdateState),
    /// The event was already applied; nothing changed.
    Duplicate,
}

impl ProgressOutcome {
    fn metric_label(&self) -> &'static str {
        match self {
            Self::Applied(_) => "applied",
            Self::Duplicate => "duplicate",
        }
    }
}

/// A final outcome reported by an agent or decided by the control plane.
#[derive(Clone, Debug, Serialize)]
pub struct TerminalEvent {
    pub gateway_id: GatewayId,
    pub update_id: Option<UpdateId>,
    pub version: String,
    pub outcome: UpdateState,
    pub error: Option<String>,
    pub error_kind: Option<FailureKind>,
    pub log: Option<String>,
}

impl TerminalEvent {
    pub fn from_report(report: TerminalReport, outcome: UpdateState) -> Self {
        Self {
            gateway_id: report.gateway_id,
            update_id: report.update_id,
            version: report.version,
            outcome,
            error: report.error,
            error_kind: report.error_kind,
            log: report.log,
        }
    }
}

/// One gateway's row as shown to operators.
#[derive(Clone, Debug, Serialize)]
pub struct GatewayUpdateView {
    pub update_id: String,
    pub gateway_id: String,
    pub manifest_id: String,
    pub version: String,
    pub state: String,
    pub progress_percentage: i64,
    pub current_step: String,
    pub logs: Vec<String>,
    pub retry_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub dispatched_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    pub rollback_requested: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
}

impl From<&GatewayUpdateRow> for GatewayUpdateView {
    fn from(row: &GatewayUpdateRow) -> Self {
        Self {
            update_id: row.update_id.to_string(),
            gateway_id: row.gateway_id.clone(),
            manifest_id: row.manifest_id.to_string(),
            version: row.version.clone(),
            state: row.state.clone(),
            progress_percentage: row.progress_percentage,
            current_step: row.current_step.clone(),
            logs: row
                .logs
                .lines()
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect(),
            retry_count: row.retry_count,
            error: row.error.clone(),
            error_kind: row.error_kind.clone(),
            dispatched_at: row.dispatched_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
            rollback_requested: row.rollback_requested_at.is_some(),
            duration_ms: row.duration_ms,
        }
    }
}

/// Rollout progress for a manifest.
#[derive(Clone, Debug, Serialize)]
pub struct RolloutStatus {
    pub manifest_id: String,
    pub version: String,
    pub status: String,
    pub rollout_percentage: i64,
    pub total: i64,
    pub updated: i64,
    pub failed: i64,
    pub success_rate: f64,
    pub gateways: Vec<GatewayUpdateView>,
}

/// Escalation as shown to operators.
#[derive(Clone, Debug, Serialize)]
pub struct EscalationView {
    pub escalation_id: String,
    pub gateway_id: String,
    pub manifest_id: String,
    pub update_id: String,
    pub severity: String,
    pub message: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub acknowledged_at: Option<OffsetDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acknowledged_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl From<&EscalationRow> for EscalationView {
    fn from(row: &EscalationRow) -> Self {
        Self {
            escalation_id: row.escalation_id.to_string(),
            gateway_id: row.gateway_id.clone(),
            manifest_id: row.manifest_id.to_string(),
            update_id: row.update_id.to_string(),
            severity: row.severity.clone(),
            message: row.message.clone(),
            created_at: row.created_at,
            acknowledged_at: row.acknowledged_at,
            acknowledged_by: row.acknowledged_by.clone(),
            note: row.note.clone(),
        }
    }
}

fn digest<T: Serialize>(event: &T) -> FleetResult<String> {
    let bytes = serde_json::to_vec(event)
        .map_err(|e| FleetError::InvalidRequest(format!("unencodable event: {e}")))?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

fn non_empty(s: &str) -> Option<String> {
    let trimmed = s.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

#[derive(Clone)]
pub struct Tracker {
    metadata: Arc<dyn MetadataStore>,
    orchestrator: Orchestrator,
    notifier: Arc<dyn Notifier>,
    config: RolloutConfig,
}

impl Tracker {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        orchestrator: Orchestrator,
        notifier: Arc<dyn Notifier>,
        config: RolloutConfig,
    ) -> Self {
        Self {
            metadata,
            orchestrator,
            notifier,
            config,
        }
    }

    async fn update(&self, update_id: Uuid) -> FleetResult<GatewayUpdateRow> {
        self.metadata
            .get_update(update_id)
            .await?
            .ok_or_else(|| FleetError::NotFound(format!("update {update_id}")))
    }

    async fn manifest(&self, manifest_id: Uuid) -> FleetResult<ManifestRow> {
        self.metadata
            .get_manifest(manifest_id)
            .await?
            .ok_or_else(|| FleetError::NotFound(format!("manifest {manifest_id}")))
    }

    /// Apply a progress event. Re-deliveries of any event already applied to
    /// the row are acknowledged without touching it, however late they
    /// arrive; illegal edges are rejected and leave it unchanged.
    pub async fn on_progress(
        &self,
        ctx: &RequestContext,
        report: &ProgressReport,
    ) -> FleetResult<ProgressOutcome> {
        let outcome = self.apply_progress(ctx, report).await;
        let label = match &outcome {
            Ok(o) => o.metric_label(),
            Err(_) => "rejected",
        };
        metrics::record_progress(label);
        outcome
    }

    async fn apply_progress(
        &self,
        ctx: &RequestContext,
        report: &ProgressReport,
    ) -> FleetResult<ProgressOutcome> {
        let message = &report.message;
        let row = self.update(*message.update_id.as_uuid()).await?;
        if row.gateway_id != report.gateway_id.as_str() {
            return Err(FleetError::GatewayMismatch {
                update_id: row.update_id.to_string(),
                gateway_id: report.gateway_id.to_string(),
            });
        }

        let event_digest = digest(report)?;
        if self.metadata.has_event(row.update_id, &event_digest).await? {
            return Ok(ProgressOutcome::Duplicate);
        }

        let to = message.state;
        if to.is_terminal() {
            let failed = to == UpdateState::Failed;
            let event = TerminalEvent {
                gateway_id: report.gateway_id.clone(),
                update_id: Some(message.update_id),
                version: row.version.clone(),
                outcome: to,
                error: if failed { non_empty(&message.log) } else { None },
                error_kind: None,
                log: non_empty(&message.log),
            };
            return self.on_terminal(ctx, &event).await;
        }

        let from = UpdateState::parse(&row.state)?;
        if from != to {
            from.transition(to, false)?;
        } else if from.is_terminal() {
            return Ok(ProgressOutcome::Duplicate);
        }

        let now = OffsetDateTime::now_utc();
        let mut applying_started_at = None;
        if from != to {
            match to {
                UpdateState::BackingUp => {
                    let backup = GatewayBackupRow {
                        backup_id: Uuid::new_v4(),
                        gateway_id: row.gateway_id.clone(),
                        manifest_id: row.manifest_id,
                        update_id: row.update_id,
                        bundle_path: message.backup_path.clone(),
                        confirmed: false,
                        created_at: now,
                        confirmed_at: None,
                        retain_until: now + self.config.backup_retention(),
                    };
                    self.metadata.create_backup(&backup).await?;
                }
                UpdateState::Applying => {
                    if self
                        .metadata
                        .get_backup(&row.gateway_id, row.manifest_id)
                        .await?
                        .is_none()
                    {
                        return Err(FleetError::Precondition(format!(
                            "no backup recorded for update {}",
                            row.update_id
                        )));
                    }
                    self.metadata
                        .confirm_backup(
                            &row.gateway_id,
                            row.manifest_id,
                            message.backup_path.as_deref(),
                            now,
                        )
                        .await?;
                    applying_started_at = Some(now);
                }
                _ => {}
            }
        }

        let change = ProgressChange {
            state: to.as_str().to_string(),
            progress_percentage: i64::from(message.progress_percentage.min(100)),
            current_step: non_empty(&message.current_step).unwrap_or_else(|| to.as_str().to_string()),
            log_line: non_empty(&message.log),
            event_digest: event_digest.clone(),
            applying_started_at,
            at: now,
        };

        let applied = self
            .metadata
            .apply_progress(row.update_id, from.as_str(), &change)
            .await?;
        if !applied {
            if self.metadata.has_event(row.update_id, &event_digest).await? {
                return Ok(ProgressOutcome::Duplicate);
            }
            let current = self.update(row.update_id).await?;
            return Err(FleetError::StateTransition {
                from: UpdateState::parse(&current.state)?,
                to,
            });
        }

        tracing::debug!(
            trace_id = %ctx.trace_id,
            gateway_id = %row.gateway_id,
            update_id = %row.update_id,
            from = %from,
            to = %to,
            progress = message.progress_percentage,
            "Progress applied"
        );
        Ok(ProgressOutcome::Applied(to))
    }

    /// Apply a final outcome. Triggers automatic rollback for rollback-safe
    /// releases and escalates failed restores.
    pub async fn on_terminal(
        &self,
        ctx: &RequestContext,
        event: &TerminalEvent,
    ) -> FleetResult<ProgressOutcome> {
        if !event.outcome.is_terminal() {
            return Err(FleetError::InvalidRequest(format!(
                "{} is not a final outcome",
                event.outcome
            )));
        }

        let row = match event.update_id {
            Some(update_id) => self.update(*update_id.as_uuid()).await?,
            None => self
                .metadata
                .find_update_by_version(event.gateway_id.as_str(), &event.version)
                .await?
                .ok_or_else(|| {
                    FleetError::NotFound(format!(
                        "update to {} for gateway {}",
                        event.version, event.gateway_id
                    ))
                })?,
        };
        if row.gateway_id != event.gateway_id.as_str() {
            return Err(FleetError::GatewayMismatch {
                update_id: row.update_id.to_string(),
                gateway_id: event.gateway_id.to_string(),
            });
        }
        if row.version != event.version {
            return Err(FleetError::InvalidRequest(format!(
                "update {} targets {}, not {}",
                row.update_id, row.version, event.version
            )));
        }

        let manifest = self.manifest(row.manifest_id).await?;
        let from = UpdateState::parse(&row.state)?;
        if from == event.outcome {
            return Ok(ProgressOutcome::Duplicate);
        }
        from.transition(event.outcome, manifest.rollback_safe)?;

        let now = OffsetDateTime::now_utc();
        let duration_ms = i64::try_from((now - row.dispatched_at).whole_milliseconds()).unwrap_or(0);
        let change = TerminalChange {
            state: event.outcome.as_str().to_string(),
            error: event.error.clone(),
            error_kind: event.error_kind.map(|k| k.as_str().to_string()),
            log_line: event.log.clone(),
            event_digest: digest(event)?,
            completed_at: now,
            duration_ms,
        };

        let applied = self
            .metadata
            .apply_terminal(row.update_id, from.as_str(), &change)
            .await?;
        if !applied {
            let current = self.update(row.update_id).await?;
            if current.state == event.outcome.as_str() {
                return Ok(ProgressOutcome::Duplicate);
            }
            return Err(FleetError::StateTransition {
                from: UpdateState::parse(&current.state)?,
                to: event.outcome,
            });
        }

        metrics::TERMINAL_OUTCOMES
            .with_label_values(&[event.outcome.as_str()])
            .inc();
        if event.outcome == UpdateState::Success {
            metrics::UPDATE_DURATION.observe(duration_ms as f64 / 1000.0);
        }

        match event.outcome {
            UpdateState::Success => tracing::info!(
                trace_id = %ctx.trace_id,
                gateway_id = %row.gateway_id,
                update_id = %row.update_id,
                version = %row.version,
                duration_ms,
                "Update succeeded"
            ),
            UpdateState::Failed => tracing::warn!(
                trace_id = %ctx.trace_id,
                gateway_id = %row.gateway_id,
                update_id = %row.update_id,
                version = %row.version,
                error = event.error.as_deref().unwrap_or(""),
                error_kind = event.error_kind.map(|k| k.as_str()).unwrap_or("unknown"),
                "Update failed"
            ),
            _ => tracing::info!(
                trace_id = %ctx.trace_id,
                gateway_id = %row.gateway_id,
                update_id = %row.update_id,
                version = %row.version,
                "Update rolled back"
            ),
        }

        if event.outcome == UpdateState::Failed {
            let critical = event.error_kind.is_some_and(|k| k.is_critical());
            if critical {
                let message = event
                    .error
                    .clone()
                    .unwrap_or_else(|| "restore after failed apply did not succeed".to_string());
                self.escalate(ctx, &row, &message).await?;
            } else if manifest.rollback_safe
                && manifest.status != ManifestStatus::RolledBack.as_str()
            {
                self.orchestrator
                    .request_rollback(ctx, &row, &manifest)
                    .await?;
            }
        }

        self.orchestrator.complete(ctx, row.manifest_id).await?;
        Ok(ProgressOutcome::Applied(event.outcome))
    }

    /// Record a critical escalation and notify operators. Never retried
    /// automatically; a repeat for the same update is a no-op.
    pub async fn escalate(
        &self,
        ctx: &RequestContext,
        row: &GatewayUpdateRow,
        message: &str,
    ) -> FleetResult<()> {
        let escalation = EscalationRow {
            escalation_id: Uuid::new_v4(),
            gateway_id: row.gateway_id.clone(),
            manifest_id: row.manifest_id,
            update_id: row.update_id,
            severity: "critical".to_string(),
            message: message.to_string(),
            created_at: OffsetDateTime::now_utc(),
            acknowledged_at: None,
            acknowledged_by: None,
            note: None,
        };
        if !self.metadata.create_escalation(&escalation).await? {
            return Ok(());
        }

        metrics::ESCALATIONS_OPENED.inc();
        tracing::error!(
            critical = true,
            trace_id = %ctx.trace_id,
            escalation_id = %escalation.escalation_id,
            gateway_id = %row.gateway_id,
            update_id = %row.update_id,
            version = %row.version,
            message,
            "Gateway needs manual intervention"
        );

        if let Err(e) = self.notifier.notify(&escalation).await {
            tracing::warn!(
                escalation_id = %escalation.escalation_id,
                error = %e,
                "Failed to deliver escalation notification"
            );
        }
        Ok(())
    }

    /// Aggregate and per-gateway view of a manifest's rollout.
    pub async fn rollout_status(&self, manifest_id: Uuid) -> FleetResult<RolloutStatus> {
        let manifest = self.manifest(manifest_id).await?;
        let counts = self.metadata.recount_manifest(manifest_id).await?;
        let rows = self.metadata.list_updates_for_manifest(manifest_id).await?;
        Ok(RolloutStatus {
            manifest_id: manifest_id.to_string(),
            version: manifest.version,
            status: manifest.status,
            rollout_percentage: manifest.rollout_percentage,
            total: counts.total,
            updated: counts.updated,
            failed: counts.failed,
            success_rate: counts.success_rate(),
            gateways: rows.iter().map(GatewayUpdateView::from).collect(),
        })
    }

    /// Update history of one gateway, newest first.
    pub async fn gateway_history(&self, gateway: &GatewayId) -> FleetResult<Vec<GatewayUpdateView>> {
        let rows = self
            .metadata
            .list_updates_for_gateway(gateway.as_str())
            .await?;
        Ok(rows.iter().map(GatewayUpdateView::from).collect())
    }

    pub async fn list_escalations(&self, open_only: bool) -> FleetResult<Vec<EscalationView>> {
        let rows = self.metadata.list_escalations(open_only).await?;
        Ok(rows.iter().map(EscalationView::from).collect())
    }

    /// Close an escalation with an operator note. Acknowledging twice keeps
    /// the first acknowledgement.
    pub async fn acknowledge(
        &self,
        ctx: &RequestContext,
        escalation_id: Uuid,
        note: &str,
    ) -> FleetResult<EscalationView> {
        let note = note.trim();
        if note.is_empty() {
            return Err(FleetError::InvalidRequest(
                "acknowledgement requires a note".to_string(),
            ));
        }

        let acknowledged = self
            .metadata
            .acknowledge_escalation(escalation_id, &ctx.actor, note, OffsetDateTime::now_utc())
            .await?;
        let row = self
            .metadata
            .get_escalation(escalation_id)
            .await?
            .ok_or_else(|| FleetError::NotFound(format!("escalation {escalation_id}")))?;

        if acknowledged {
            tracing::info!(
                trace_id = %ctx.trace_id,
                actor = %ctx.actor,
                escalation_id = %escalation_id,
                gateway_id = %row.gateway_id,
                "Escalation acknowledged"
            );
        }
        Ok(EscalationView::from(&row))
    }
}
