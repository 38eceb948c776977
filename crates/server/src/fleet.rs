//! The control plane services bundled together, plus the periodic sweeps
//! that need more than one of them.

use crate::bus::Bus;
use crate::context::RequestContext;
use crate::error::FleetResult;
use crate::metrics;
use crate::notify::Notifier;
use crate::orchestrator::Orchestrator;
use crate::registry::Registry;
use crate::tracker::{TerminalEvent, Tracker};
use otter_core::config::AppConfig;
use otter_core::{FailureKind, GatewayId, UpdateId, UpdateState};
use otter_metadata::MetadataStore;
use otter_signer::Signer;
use std::sync::Arc;
use time::OffsetDateTime;

#[derive(Clone)]
pub struct Fleet {
    pub registry: Registry,
    pub orchestrator: Orchestrator,
    pub tracker: Tracker,
    metadata: Arc<dyn MetadataStore>,
    apply_timeout: time::Duration,
}

impl Fleet {
    pub fn new(
        config: &AppConfig,
        metadata: Arc<dyn MetadataStore>,
        signer: Option<Arc<dyn Signer>>,
        bus: Arc<dyn Bus>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let registry = Registry::new(metadata.clone(), signer, config.server.clone());
        let orchestrator = Orchestrator::new(metadata.clone(), bus, config.rollout.clone());
        let tracker = Tracker::new(
            metadata.clone(),
            orchestrator.clone(),
            notifier,
            config.rollout.clone(),
        );
        Self {
            registry,
            orchestrator,
            tracker,
            metadata,
            apply_timeout: config.rollout.apply_timeout(),
        }
    }

    /// Fail updates stuck in `applying` past the apply timeout. The failure
    /// goes through the normal terminal path, so rollback-safe releases get
    /// a rollback command.
    pub async fn sweep_apply_timeouts(&self, ctx: &RequestContext) -> FleetResult<usize> {
        let cutoff = OffsetDateTime::now_utc() - self.apply_timeout;
        let stale = self.metadata.list_stale_applying(cutoff).await?;

        let mut failed = 0;
        for row in stale {
            let gateway_id = GatewayId::parse(&row.gateway_id)?;
            let event = TerminalEvent {
                gateway_id,
                update_id: Some(UpdateId::from_uuid(row.update_id)),
                version: row.version.clone(),
                outcome: UpdateState::Failed,
                error: Some("apply timeout".to_string()),
                error_kind: Some(FailureKind::ApplyTimeout),
                log: Some(format!(
                    "no outcome reported within {}s of entering applying",
                    self.apply_timeout.whole_seconds()
                )),
            };

            // A report racing the sweep wins; the CAS rejects the timeout.
            match self.tracker.on_terminal(ctx, &event).await {
                Ok(_) => {
                    metrics::APPLY_TIMEOUTS.inc();
                    failed += 1;
                    tracing::warn!(
                        trace_id = %ctx.trace_id,
                        gateway_id = %row.gateway_id,
                        update_id = %row.update_id,
                        "Apply timed out"
                    );
                }
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => tracing::debug!(
                    update_id = %row.update_id,
                    error = %e,
                    "Skipping apply timeout"
                ),
            }
        }
        Ok(failed)
    }
}
