//! Rollout orchestration: target selection, dispatch, rollback and
//! redelivery of gateway commands.

use crate::bus::Bus;
use crate::context::RequestContext;
use crate::error::{FleetError, FleetResult};
use crate::metrics;
use crate::registry::agent_is_compatible;
use otter_core::config::RolloutConfig;
use otter_core::transport::commands_topic;
use otter_core::{CommandKind, CommandMessage, GatewayId, ManifestStatus, UpdateId, UpdateState};
use otter_metadata::MetadataStore;
use otter_metadata::models::{DispatchSlot, GatewayUpdateRow, ManifestCounts, ManifestRow};
use serde::Serialize;
use std::sync::Arc;
use time::OffsetDateTime;
use uuid::Uuid;

/// Result of a rollout for one gateway.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// A new pending row was created and the command published.
    Dispatched,
    /// The gateway already had an in-flight row for this manifest; the
    /// command was re-published with the same update id.
    AlreadyDispatched,
    /// Nothing was sent.
    Skipped,
}

impl DispatchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dispatched => "dispatched",
            Self::AlreadyDispatched => "already_dispatched",
            Self::Skipped => "skipped",
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct GatewayDispatch {
    pub gateway_id: String,
    pub outcome: DispatchOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct RolloutReport {
    pub manifest_id: String,
    pub version: String,
    pub percentage: u8,
    pub selected: usize,
    pub gateways: Vec<GatewayDispatch>,
}

#[derive(Clone, Debug, Serialize)]
pub struct RollbackReport {
    pub manifest_id: String,
    pub version: String,
    pub status: String,
    pub rollback_commands: usize,
}

/// Deterministic target selection: sort and dedupe the ids, then take the
/// first `floor(len * percentage / 100)`.
pub fn select_targets(targets: &[GatewayId], percentage: u8) -> Vec<GatewayId> {
    let mut sorted: Vec<GatewayId> = targets.to_vec();
    sorted.sort();
    sorted.dedup();
    let count = sorted.len() * usize::from(percentage.min(100)) / 100;
    sorted.truncate(count);
    sorted
}

#[derive(Clone)]
pub struct Orchestrator {
    metadata: Arc<dyn MetadataStore>,
    bus: Arc<dyn Bus>,
    config: RolloutConfig,
}

impl Orchestrator {
    pub fn new(metadata: Arc<dyn MetadataStore>, bus: Arc<dyn Bus>, config: RolloutConfig) -> Self {
        Self {
            metadata,
            bus,
            config,
        }
    }

    async fn manifest(&self, manifest_id: Uuid) -> FleetResult<ManifestRow> {
        self.metadata
            .get_manifest(manifest_id)
            .await?
            .ok_or_else(|| FleetError::NotFound(format!("manifest {manifest_id}")))
    }

    /// Dispatch a manifest to a percentage of the given gateways.
    ///
    /// Re-invoking with identical arguments creates no new rows.
    pub async fn rollout(
        &self,
        ctx: &RequestContext,
        manifest_id: Uuid,
        targets: &[GatewayId],
        percentage: u8,
    ) -> FleetResult<RolloutReport> {
        if percentage > 100 {
            return Err(FleetError::InvalidRequest(format!(
                "percentage must be 0..=100, got {percentage}"
            )));
        }

        let manifest = self.manifest(manifest_id).await?;
        if !manifest.is_published() {
            return Err(FleetError::NotPublished(manifest.version));
        }
        let status = ManifestStatus::parse(&manifest.status)?;
        if !status.accepts_rollout() {
            return Err(FleetError::RolloutClosed {
                version: manifest.version,
                status: status.as_str().to_string(),
            });
        }

        let selected = select_targets(targets, percentage);
        let mut gateways = Vec::with_capacity(selected.len());

        for gateway in &selected {
            let dispatch = self.dispatch_one(ctx, &manifest, gateway).await?;
            metrics::record_dispatch(dispatch.outcome.as_str());
            gateways.push(dispatch);
        }

        let now = OffsetDateTime::now_utc();
        if status != ManifestStatus::RollingOut {
            let next = status.advance(ManifestStatus::RollingOut)?;
            self.metadata
                .update_manifest_status(manifest_id, status.as_str(), next.as_str(), now)
                .await?;
        }
        self.metadata
            .raise_rollout_percentage(manifest_id, i64::from(percentage), now)
            .await?;
        self.metadata.recount_manifest(manifest_id).await?;

        tracing::info!(
            trace_id = %ctx.trace_id,
            actor = %ctx.actor,
            manifest_id = %manifest_id,
            version = %manifest.version,
            percentage,
            targets = targets.len(),
            selected = selected.len(),
            "Rollout dispatched"
        );

        Ok(RolloutReport {
            manifest_id: manifest_id.to_string(),
            version: manifest.version,
            percentage,
            selected: selected.len(),
            gateways,
        })
    }

    async fn dispatch_one(
        &self,
        ctx: &RequestContext,
        manifest: &ManifestRow,
        gateway: &GatewayId,
    ) -> FleetResult<GatewayDispatch> {
        let now = OffsetDateTime::now_utc();
        let row = GatewayUpdateRow {
            update_id: *UpdateId::new().as_uuid(),
            gateway_id: gateway.to_string(),
            manifest_id: manifest.manifest_id,
            version: manifest.version.clone(),
            state: UpdateState::Pending.as_str().to_string(),
            progress_percentage: 0,
            current_step: UpdateState::Pending.as_str().to_string(),
            logs: String::new(),
            last_event_digest: None,
            retry_count: 0,
            error: None,
            error_kind: None,
            dispatched_at: now,
            updated_at: now,
            applying_started_at: None,
            rollback_requested_at: None,
            completed_at: None,
            duration_ms: None,
        };

        let (outcome, row, reason) = match self.metadata.dispatch_update(&row).await? {
            DispatchSlot::Created(row) => (DispatchOutcome::Dispatched, row, None),
            DispatchSlot::Existing(row) => {
                if UpdateState::parse(&row.state)?.is_active() {
                    (DispatchOutcome::AlreadyDispatched, row, None)
                } else {
                    let reason = format!("update already {}", row.state);
                    (DispatchOutcome::Skipped, row, Some(reason))
                }
            }
            DispatchSlot::Blocked(active) => {
                let reason = format!("update to {} is {}", active.version, active.state);
                (DispatchOutcome::Skipped, active, Some(reason))
            }
        };

        if outcome == DispatchOutcome::Skipped {
            tracing::info!(
                trace_id = %ctx.trace_id,
                gateway_id = %gateway,
                version = %manifest.version,
                reason = reason.as_deref().unwrap_or(""),
                "Gateway skipped"
            );
            return Ok(GatewayDispatch {
                gateway_id: gateway.to_string(),
                outcome,
                update_id: None,
                reason,
            });
        }

        self.publish_command(CommandKind::Update, &row, manifest).await;

        Ok(GatewayDispatch {
            gateway_id: gateway.to_string(),
            outcome,
            update_id: Some(row.update_id.to_string()),
            reason: None,
        })
    }

    /// Command carrying the manifest's locations for one gateway row.
    pub fn command_for(
        kind: CommandKind,
        row: &GatewayUpdateRow,
        manifest: &ManifestRow,
    ) -> FleetResult<CommandMessage> {
        let (Some(manifest_url), Some(signature_url)) =
            (manifest.manifest_url.clone(), manifest.signature_url.clone())
        else {
            return Err(FleetError::NotPublished(manifest.version.clone()));
        };
        Ok(CommandMessage {
            command: kind,
            version: manifest.version.clone(),
            manifest_url,
            signature_url,
            update_id: UpdateId::from_uuid(row.update_id),
        })
    }

    /// Best-effort publish on the gateway's command topic. Failures are logged;
    /// the gateway still receives the command through `GET /updates/check`.
    pub async fn publish_command(
        &self,
        kind: CommandKind,
        row: &GatewayUpdateRow,
        manifest: &ManifestRow,
    ) {
        let result = async {
            let gateway = GatewayId::parse(&row.gateway_id)?;
            let command = Self::command_for(kind, row, manifest)?;
            let payload = serde_json::to_vec(&command)
                .map_err(|e| FleetError::Bus(format!("failed to encode command: {e}")))?;
            self.bus.publish(&commands_topic(&gateway), payload).await
        }
        .await;

        match result {
            Ok(()) => tracing::debug!(
                gateway_id = %row.gateway_id,
                update_id = %row.update_id,
                command = %kind,
                "Command published"
            ),
            Err(e) => tracing::warn!(
                gateway_id = %row.gateway_id,
                update_id = %row.update_id,
                command = %kind,
                error = %e,
                "Failed to publish command, gateway will pick it up by polling"
            ),
        }
    }

    /// Ask a gateway to roll back a failed update. Returns false if a rollback
    /// was already requested for this row.
    pub async fn request_rollback(
        &self,
        ctx: &RequestContext,
        row: &GatewayUpdateRow,
        manifest: &ManifestRow,
    ) -> FleetResult<bool> {
        let marked = self
            .metadata
            .mark_rollback_requested(row.update_id, OffsetDateTime::now_utc())
            .await?;
        if !marked {
            return Ok(false);
        }

        self.publish_command(CommandKind::Rollback, row, manifest)
            .await;
        metrics::ROLLBACKS_REQUESTED.inc();
        tracing::info!(
            trace_id = %ctx.trace_id,
            gateway_id = %row.gateway_id,
            update_id = %row.update_id,
            version = %row.version,
            "Rollback requested"
        );
        Ok(true)
    }

    /// Operator rollback of a whole manifest: halt dispatch and send Rollback
    /// commands to every gateway whose update failed.
    pub async fn rollback(
        &self,
        ctx: &RequestContext,
        manifest_id: Uuid,
    ) -> FleetResult<RollbackReport> {
        let manifest = self.manifest(manifest_id).await?;
        let status = ManifestStatus::parse(&manifest.status)?;

        if status != ManifestStatus::RolledBack {
            let next = status.rollback()?;
            let changed = self
                .metadata
                .update_manifest_status(
                    manifest_id,
                    status.as_str(),
                    next.as_str(),
                    OffsetDateTime::now_utc(),
                )
                .await?;
            if !changed {
                return Err(FleetError::StatusTransition(format!(
                    "{status} -> {next} (status changed concurrently)"
                )));
            }
            tracing::warn!(
                trace_id = %ctx.trace_id,
                actor = %ctx.actor,
                manifest_id = %manifest_id,
                version = %manifest.version,
                "Manifest rolled back by operator"
            );
        }

        let mut rollback_commands = 0;
        for row in self.metadata.list_updates_for_manifest(manifest_id).await? {
            if row.state == UpdateState::Failed.as_str()
                && self.request_rollback(ctx, &row, &manifest).await?
            {
                rollback_commands += 1;
            }
        }

        Ok(RollbackReport {
            manifest_id: manifest_id.to_string(),
            version: manifest.version,
            status: ManifestStatus::RolledBack.as_str().to_string(),
            rollback_commands,
        })
    }

    /// Recount aggregates and mark the manifest completed once every
    /// dispatched gateway reached a final outcome. Safe to call repeatedly.
    pub async fn complete(
        &self,
        ctx: &RequestContext,
        manifest_id: Uuid,
    ) -> FleetResult<ManifestCounts> {
        let counts = self.metadata.recount_manifest(manifest_id).await?;
        if counts.is_complete()
            && self
                .metadata
                .complete_manifest_if_done(manifest_id, OffsetDateTime::now_utc())
                .await?
        {
            tracing::info!(
                trace_id = %ctx.trace_id,
                manifest_id = %manifest_id,
                updated = counts.updated,
                failed = counts.failed,
                total = counts.total,
                "Rollout completed"
            );
        }
        Ok(counts)
    }

    /// Command to hand a polling gateway, if any.
    ///
    /// A pending rollback wins over an update. Updates whose compatibility
    /// range excludes the reported agent version are withheld.
    pub async fn check(
        &self,
        gateway: &GatewayId,
        current_version: &str,
    ) -> FleetResult<Option<CommandMessage>> {
        let rollbacks = self
            .metadata
            .list_pending_rollbacks(gateway.as_str())
            .await?;
        if let Some(row) = rollbacks.into_iter().next() {
            let manifest = self.manifest(row.manifest_id).await?;
            return Ok(Some(Self::command_for(
                CommandKind::Rollback,
                &row,
                &manifest,
            )?));
        }

        // Every non-terminal row is offered, `applying` included: an agent
        // that restarts mid-update has lost its pipeline and resumes from
        // this command. A live pipeline on the gateway holds the update lock,
        // and an agent already on the target version reports success.
        let Some(row) = self.metadata.get_active_update(gateway.as_str()).await? else {
            return Ok(None);
        };
        let manifest = self.manifest(row.manifest_id).await?;
        if manifest.status == ManifestStatus::RolledBack.as_str() {
            return Ok(None);
        }
        if !agent_is_compatible(current_version, &manifest)? {
            tracing::warn!(
                gateway_id = %gateway,
                current_version,
                version = %manifest.version,
                min = %manifest.min_gateway_version,
                max = %manifest.max_gateway_version,
                "Withholding incompatible update"
            );
            return Ok(None);
        }

        Ok(Some(Self::command_for(
            CommandKind::Update,
            &row,
            &manifest,
        )?))
    }

    /// Re-publish commands for rows still `pending` after the redelivery
    /// interval, up to `max_retries` times per row.
    pub async fn redeliver_pending(&self, ctx: &RequestContext) -> FleetResult<usize> {
        let now = OffsetDateTime::now_utc();
        let max_retries = i64::from(self.config.max_retries);
        let stale = self
            .metadata
            .list_stale_pending(now - self.config.redelivery_interval(), max_retries)
            .await?;

        let mut redelivered = 0;
        for row in stale {
            let manifest = self.manifest(row.manifest_id).await?;
            if manifest.status == ManifestStatus::RolledBack.as_str() {
                continue;
            }
            if !self
                .metadata
                .record_redelivery(row.update_id, max_retries, now)
                .await?
            {
                continue;
            }
            self.publish_command(CommandKind::Update, &row, &manifest)
                .await;
            metrics::COMMAND_REDELIVERIES.inc();
            redelivered += 1;

            if row.retry_count + 1 >= max_retries {
                tracing::warn!(
                    trace_id = %ctx.trace_id,
                    gateway_id = %row.gateway_id,
                    update_id = %row.update_id,
                    "Retry budget exhausted, update left pending for operator attention"
                );
            }
        }
        Ok(redelivered)
    }

    /// Drop backup references past their retention deadline.
    pub async fn purge_expired_backups(&self, ctx: &RequestContext) -> FleetResult<u64> {
        let purged = self
            .metadata
            .purge_expired_backups(OffsetDateTime::now_utc())
            .await?;
        if purged > 0 {
            tracing::info!(trace_id = %ctx.trace_id, purged, "Expired backup references purged");
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> Vec<GatewayId> {
        names.iter().map(|n| GatewayId::parse(n).unwrap()).collect()
    }

    #[test]
    fn test_select_targets_half() {
        let selected = select_targets(&ids(&["D", "B", "C", "A"]), 50);
        assert_eq!(selected, ids(&["A", "B"]));
    }

    #[test]
    fn test_select_targets_floor_and_dedup() {
        assert!(select_targets(&ids(&["A", "B", "C"]), 33).is_empty());
        assert_eq!(select_targets(&ids(&["A", "B", "C"]), 34), ids(&["A"]));
        assert_eq!(select_targets(&ids(&["B", "A", "B"]), 100), ids(&["A", "B"]));
        assert!(select_targets(&ids(&["A"]), 0).is_empty());
        assert!(select_targets(&[], 100).is_empty());
    }

    #[test]
    fn test_select_targets_is_stable_prefix() {
        let targets = ids(&["g3", "g1", "g4", "g2", "g5"]);
        let small = select_targets(&targets, 40);
        let large = select_targets(&targets, 80);
        assert_eq!(&large[..small.len()], &small[..]);
    }
}
