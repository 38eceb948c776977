//! Long-running control plane tasks: the periodic sweeper and the bus
//! listener that feeds agent progress into the tracker.

use crate::context::RequestContext;
use crate::jobs::Job;
use crate::state::AppState;
use otter_core::transport::gateway_from_progress_topic;
use otter_core::{ProgressMessage, ProgressReport};
use tokio::task::JoinHandle;

/// Topic filter matching every gateway's progress topic.
pub const PROGRESS_FILTER: &str = "gateways/+/progress";

/// Every sweep interval, queue the apply-timeout sweep, pending-command
/// redelivery and backup purge.
pub fn spawn_sweeper(state: AppState) -> JoinHandle<()> {
    let interval = state.config.rollout.sweep_interval();
    tokio::spawn(async move {
        tracing::info!(interval_secs = interval.as_secs(), "Sweeper started");
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            for job in [
                Job::SweepApplyTimeouts,
                Job::RedeliverPending,
                Job::PurgeBackups,
            ] {
                let name = job.name();
                if let Err(e) = state
                    .jobs
                    .enqueue(RequestContext::system("sweeper"), job)
                    .await
                {
                    tracing::error!(job = name, error = %e, "Failed to queue sweep");
                }
            }
        }
    })
}

/// Decode a progress message published on a gateway's progress topic.
pub fn decode_progress(topic: &str, payload: &[u8]) -> Option<ProgressReport> {
    let Some(gateway_id) = gateway_from_progress_topic(topic) else {
        tracing::warn!(topic, "Progress on malformed topic");
        return None;
    };
    match serde_json::from_slice::<ProgressMessage>(payload) {
        Ok(message) => Some(ProgressReport {
            gateway_id,
            message,
        }),
        Err(e) => {
            tracing::warn!(topic, error = %e, "Dropping undecodable progress message");
            None
        }
    }
}

/// Subscribe to all progress topics and route each message through the job
/// queue. Delivery is at-least-once from the agent; duplicates are absorbed
/// by the tracker.
pub fn spawn_progress_listener(state: AppState) -> anyhow::Result<JoinHandle<()>> {
    let mut subscription = state.bus.subscribe(PROGRESS_FILTER)?;
    Ok(tokio::spawn(async move {
        tracing::info!(filter = PROGRESS_FILTER, "Progress listener started");
        while let Some(msg) = subscription.recv().await {
            let Some(report) = decode_progress(&msg.topic, &msg.payload) else {
                continue;
            };
            if let Err(e) = state
                .jobs
                .enqueue(RequestContext::system("bus"), Job::Progress(report))
                .await
            {
                tracing::error!(error = %e, "Failed to queue progress message");
                break;
            }
        }
        tracing::info!("Progress listener stopped");
    }))
}
