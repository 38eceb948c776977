//! Prometheus metrics for the fleet control plane.
//!
//! The `/metrics` endpoint is unauthenticated to allow scraping. Labels carry
//! outcomes and states only, never gateway ids. Restrict the endpoint at the
//! network level.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Registry
pub static MANIFESTS_CREATED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("otter_manifests_created_total", "Total manifests created")
        .expect("metric creation failed")
});

pub static MANIFESTS_PUBLISHED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "otter_manifests_published_total",
        "Total manifests signed and published",
    )
    .expect("metric creation failed")
});

// Orchestrator
pub static ROLLOUT_DISPATCHES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "otter_rollout_dispatches_total",
            "Per-gateway rollout results by outcome",
        ),
        &["outcome"],
    )
    .expect("metric creation failed")
});

pub static ROLLBACKS_REQUESTED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "otter_rollbacks_requested_total",
        "Total rollback commands issued to gateways",
    )
    .expect("metric creation failed")
});

pub static COMMAND_REDELIVERIES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "otter_command_redeliveries_total",
        "Total update commands re-published to idle gateways",
    )
    .expect("metric creation failed")
});

pub static APPLY_TIMEOUTS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "otter_apply_timeouts_total",
        "Total updates failed for exceeding the applying timeout",
    )
    .expect("metric creation failed")
});

// Tracker
pub static PROGRESS_EVENTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "otter_progress_events_total",
            "Progress events by handling result",
        ),
        &["result"],
    )
    .expect("metric creation failed")
});

pub static TERMINAL_OUTCOMES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "otter_terminal_outcomes_total",
            "Updates reaching a terminal state",
        ),
        &["state"],
    )
    .expect("metric creation failed")
});

pub static ESCALATIONS_OPENED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "otter_escalations_opened_total",
        "Total CRITICAL escalations opened",
    )
    .expect("metric creation failed")
});

pub static UPDATE_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "otter_update_duration_seconds",
            "Time from dispatch to terminal state",
        )
        .buckets(vec![
            10.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0, 3600.0, 21600.0,
        ]),
    )
    .expect("metric creation failed")
});

// Job queue
pub static JOBS_IN_FLIGHT: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new("otter_jobs_in_flight", "Jobs currently being executed")
        .expect("metric creation failed")
});

pub static JOB_RETRIES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "otter_job_retries_total",
            "Job attempts retried after a transient error",
        ),
        &["job"],
    )
    .expect("metric creation failed")
});

/// Guard to ensure metrics are only registered once.
static REGISTER_ONCE: Once = Once::new();

/// Register all metrics with the global registry.
///
/// Idempotent, so tests and embedded routers may call it freely.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(MANIFESTS_CREATED.clone()),
            Box::new(MANIFESTS_PUBLISHED.clone()),
            Box::new(ROLLOUT_DISPATCHES.clone()),
            Box::new(ROLLBACKS_REQUESTED.clone()),
            Box::new(COMMAND_REDELIVERIES.clone()),
            Box::new(APPLY_TIMEOUTS.clone()),
            Box::new(PROGRESS_EVENTS.clone()),
            Box::new(TERMINAL_OUTCOMES.clone()),
            Box::new(ESCALATIONS_OPENED.clone()),
            Box::new(UPDATE_DURATION.clone()),
            Box::new(JOBS_IN_FLIGHT.clone()),
            Box::new(JOB_RETRIES.clone()),
        ];
        for collector in collectors {
            REGISTRY
                .register(collector)
                .expect("metric registration failed");
        }
    });
}

/// GET /metrics - Prometheus metrics endpoint.
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            format!("Failed to encode metrics: {e}").into_bytes(),
        ),
    }
}

pub fn record_dispatch(outcome: &str) {
    ROLLOUT_DISPATCHES.with_label_values(&[outcome]).inc();
}

pub fn record_progress(result: &str) {
    PROGRESS_EVENTS.with_label_values(&[result]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registration() {
        register_metrics();
        register_metrics();
        record_dispatch("dispatched");
        let families = REGISTRY.gather();
        assert!(
            families
                .iter()
                .any(|f| f.get_name() == "otter_rollout_dispatches_total")
        );
    }
}
