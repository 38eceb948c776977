//! Bounded worker pool for control plane work.
//!
//! HTTP handlers and the bus listener submit jobs here instead of running
//! rollout and tracking logic inline. Transient metadata errors are retried
//! with a fixed delay; a panicking job is caught and reported as failed.

use crate::context::RequestContext;
use crate::error::{FleetError, FleetResult};
use crate::fleet::Fleet;
use crate::metrics;
use crate::orchestrator::RolloutReport;
use crate::tracker::{ProgressOutcome, TerminalEvent};
use otter_core::config::RolloutConfig;
use otter_core::{GatewayId, ProgressReport};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, oneshot};
use uuid::Uuid;

const QUEUE_DEPTH: usize = 1024;

/// A unit of control plane work.
#[derive(Clone, Debug)]
pub enum Job {
    Rollout {
        manifest_id: Uuid,
        targets: Vec<GatewayId>,
        percentage: u8,
    },
    Progress(ProgressReport),
    Terminal(TerminalEvent),
    SweepApplyTimeouts,
    RedeliverPending,
    PurgeBackups,
}

impl Job {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Rollout { .. } => "rollout",
            Self::Progress(_) => "progress",
            Self::Terminal(_) => "terminal",
            Self::SweepApplyTimeouts => "sweep_apply_timeouts",
            Self::RedeliverPending => "redeliver_pending",
            Self::PurgeBackups => "purge_backups",
        }
    }
}

#[derive(Debug)]
pub enum JobOutput {
    Rollout(RolloutReport),
    Progress(ProgressOutcome),
    Count(u64),
}

struct Envelope {
    job: Job,
    ctx: RequestContext,
    reply: Option<oneshot::Sender<FleetResult<JobOutput>>>,
}

/// Handle to the worker pool. Cloning is cheap.
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<Envelope>,
}

impl JobQueue {
    /// Spawn `job_workers` workers sharing one queue.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(fleet: Fleet, config: &RolloutConfig) -> Self {
        let (tx, rx) = mpsc::channel::<Envelope>(QUEUE_DEPTH);
        let rx = Arc::new(Mutex::new(rx));
        let workers = config.job_workers.max(1);
        let policy = RetryPolicy {
            attempts: config.job_retry_attempts,
            delay: config.job_retry_delay(),
        };

        for worker in 0..workers {
            let rx = rx.clone();
            let fleet = fleet.clone();
            tokio::spawn(async move {
                loop {
                    let envelope = {
                        let mut rx = rx.lock().await;
                        rx.recv().await
                    };
                    let Some(envelope) = envelope else {
                        tracing::debug!(worker, "Job queue closed, worker exiting");
                        break;
                    };
                    handle(&fleet, policy, envelope).await;
                }
            });
        }

        tracing::info!(workers, "Job workers started");
        Self { tx }
    }

    /// Run a job and wait for its result.
    pub async fn submit(&self, ctx: RequestContext, job: Job) -> FleetResult<JobOutput> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Envelope {
                job,
                ctx,
                reply: Some(reply),
            })
            .await
            .map_err(|_| FleetError::QueueClosed)?;
        rx.await.map_err(|_| FleetError::QueueClosed)?
    }

    /// Queue a job without waiting for it.
    pub async fn enqueue(&self, ctx: RequestContext, job: Job) -> FleetResult<()> {
        self.tx
            .send(Envelope {
                job,
                ctx,
                reply: None,
            })
            .await
            .map_err(|_| FleetError::QueueClosed)
    }
}

#[derive(Clone, Copy)]
struct RetryPolicy {
    attempts: u32,
    delay: Duration,
}

async fn handle(fleet: &Fleet, policy: RetryPolicy, envelope: Envelope) {
    let Envelope { job, ctx, reply } = envelope;
    let name = job.name();

    metrics::JOBS_IN_FLIGHT.inc();
    let mut attempt = 0;
    let result = loop {
        let result = run_isolated(fleet, &ctx, &job).await;
        match result {
            Err(e) if e.is_transient() && attempt < policy.attempts => {
                attempt += 1;
                metrics::JOB_RETRIES.with_label_values(&[name]).inc();
                tracing::warn!(
                    trace_id = %ctx.trace_id,
                    job = name,
                    attempt,
                    error = %e,
                    "Transient job failure, retrying"
                );
                tokio::time::sleep(policy.delay).await;
            }
            other => break other,
        }
    };
    metrics::JOBS_IN_FLIGHT.dec();

    match reply {
        // The submitter may have gone away (client disconnect).
        Some(reply) => {
            let _ = reply.send(result);
        }
        None => {
            if let Err(e) = result {
                tracing::warn!(trace_id = %ctx.trace_id, job = name, error = %e, "Job failed");
            }
        }
    }
}

/// Run the job on its own task so a panic fails the job, not the worker.
async fn run_isolated(fleet: &Fleet, ctx: &RequestContext, job: &Job) -> FleetResult<JobOutput> {
    let fleet = fleet.clone();
    let ctx = ctx.clone();
    let job = job.clone();
    let name = job.name();
    match tokio::spawn(async move { run(&fleet, &ctx, job).await }).await {
        Ok(result) => result,
        Err(join_err) => {
            tracing::error!(job = name, panic = ?join_err, "Job task panicked");
            Err(FleetError::JobAborted(name.to_string()))
        }
    }
}

async fn run(fleet: &Fleet, ctx: &RequestContext, job: Job) -> FleetResult<JobOutput> {
    match job {
        Job::Rollout {
            manifest_id,
            targets,
            percentage,
        } => fleet
            .orchestrator
            .rollout(ctx, manifest_id, &targets, percentage)
            .await
            .map(JobOutput::Rollout),
        Job::Progress(report) => fleet
            .tracker
            .on_progress(ctx, &report)
            .await
            .map(JobOutput::Progress),
        Job::Terminal(event) => fleet
            .tracker
            .on_terminal(ctx, &event)
            .await
            .map(JobOutput::Progress),
        Job::SweepApplyTimeouts => fleet
            .sweep_apply_timeouts(ctx)
            .await
            .map(|n| JobOutput::Count(n as u64)),
        Job::RedeliverPending => fleet
            .orchestrator
            .redeliver_pending(ctx)
            .await
            .map(|n| JobOutput::Count(n as u64)),
        Job::PurgeBackups => fleet
            .orchestrator
            .purge_expired_backups(ctx)
            .await
            .map(JobOutput::Count),
    }
}
