use std::time::Instant;

use axum::{
    body::Body, extract::MatchedPath, http::Request, middleware::Next, response::IntoResponse,
    routing::get, Router,
};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::types::EffectivePriority;

// Gauges
pub const FORGING_ENABLED: &str = "forging_enabled";
pub const LEADER_STATUS: &str = "leader_status";
pub const CLUSTER_ELIGIBLE: &str = "cluster_eligible";
pub const EFFECTIVE_PRIORITY: &str = "effective_priority";
pub const HEALTH_CONSECUTIVE_FAILURES: &str = "health_consecutive_failures";

// Counters
pub const LEADERSHIP_CHANGES: &str = "leadership_changes_total";
pub const SIGNAL_EVENTS: &str = "signal_events_total";
pub const CREDENTIAL_OPERATIONS: &str = "credential_operations_total";
pub const CREDENTIAL_FAILURES: &str = "credential_failures_total";
pub const STORE_ERRORS: &str = "store_errors_total";
pub const STORE_CONFLICTS: &str = "store_conflicts_total";
pub const MALFORMED_RECORDS: &str = "malformed_records_total";
pub const TICKS: &str = "ticks_total";

// Histograms
pub const TICK_DURATION: &str = "tick_duration_ms";

/// Add the prometheus endpoint and request middleware to a router. Call last.
pub fn setup_metrics_routes(router: Router) -> Result<Router, BuildError> {
    let recorder_handle = setup_metrics_recorder()?;

    Ok(router
        .route(
            "/metrics",
            get(move || std::future::ready(recorder_handle.render())),
        )
        .layer(axum::middleware::from_fn(track_metrics)))
}

pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    const BUCKETS: &[f64] = &[
        1.0, 5.0, 10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2000.0, 5000.0, 10000.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(BUCKETS)?
        .install_recorder()
}

pub async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();

    let path = if let Some(matched_path) = req.extensions().get::<MatchedPath>() {
        matched_path.as_str().to_owned()
    } else {
        req.uri().path().to_owned()
    };
    let method = req.method().clone();

    let response = next.run(req).await;

    let labels = [
        ("method", method.to_string()),
        ("path", path),
        ("status", response.status().as_u16().to_string()),
    ];
    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_requests_duration_seconds", &labels)
        .record(start.elapsed().as_secs_f64());

    response
}

/// Handle for the per-replica gauges, labelled with the pod name once.
#[derive(Debug, Clone)]
pub struct ForgeMetrics {
    pod: String,
    region: String,
}

impl ForgeMetrics {
    pub fn new(pod: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            pod: pod.into(),
            region: region.into(),
        }
    }

    pub fn set_forging(&self, forging: bool) {
        metrics::gauge!(FORGING_ENABLED, "pod" => self.pod.clone()).set(bool_gauge(forging));
    }

    pub fn set_leader(&self, leader: bool) {
        metrics::gauge!(LEADER_STATUS, "pod" => self.pod.clone()).set(bool_gauge(leader));
    }

    pub fn set_cluster(&self, eligible: bool, priority: EffectivePriority) {
        metrics::gauge!(
            CLUSTER_ELIGIBLE,
            "pod" => self.pod.clone(),
            "region" => self.region.clone()
        )
        .set(bool_gauge(eligible));
        metrics::gauge!(
            EFFECTIVE_PRIORITY,
            "pod" => self.pod.clone(),
            "region" => self.region.clone()
        )
        .set(priority.as_gauge());
    }

    pub fn set_health_failures(&self, failures: u32) {
        metrics::gauge!(HEALTH_CONSECUTIVE_FAILURES, "pod" => self.pod.clone())
            .set(f64::from(failures));
    }

    pub fn leadership_changed(&self) {
        metrics::counter!(LEADERSHIP_CHANGES, "pod" => self.pod.clone()).increment(1);
    }

    pub fn tick(&self, started: Instant) {
        metrics::counter!(TICKS).increment(1);
        metrics::histogram!(TICK_DURATION).record(started.elapsed().as_millis() as f64);
    }
}

fn bool_gauge(value: bool) -> f64 {
    if value {
        1.0
    } else {
        0.0
    }
}

pub fn store_error(operation: &'static str) {
    metrics::counter!(STORE_ERRORS, "operation" => operation).increment(1);
}

pub fn store_conflict(operation: &'static str) {
    metrics::counter!(STORE_CONFLICTS, "operation" => operation).increment(1);
}

pub fn malformed_record(kind: &'static str) {
    metrics::counter!(MALFORMED_RECORDS, "kind" => kind).increment(1);
}

pub fn credential_operation(operation: &'static str, file: &'static str) {
    metrics::counter!(CREDENTIAL_OPERATIONS, "operation" => operation, "file" => file)
        .increment(1);
}

pub fn credential_failure(operation: &'static str) {
    metrics::counter!(CREDENTIAL_FAILURES, "operation" => operation).increment(1);
}

pub fn signal_event(reason: &'static str) {
    metrics::counter!(SIGNAL_EVENTS, "reason" => reason).increment(1);
}
