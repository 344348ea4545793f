//! Process metrics
//!
//! A single process-global prometheus registry, registered once and read by
//! a small HTTP listener. Every long-running loop observes its work here;
//! the admission controller counts outcomes per resource.

use std::net::SocketAddr;
use std::sync::OnceLock;

use axum::{routing::get, Router};
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};
use tracing::info;

/// Buckets for loop step durations (seconds)
const STEP_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];

/// Global metrics handle
static GLOBAL_METRICS: OnceLock<Metrics> = OnceLock::new();

/// Typed handles to every metric the processes expose
pub struct Metrics {
    /// Duration of each recommender loop step, labelled by step name
    pub recommender_step_seconds: HistogramVec,
    /// Number of aggregate container states in the model
    pub aggregate_states: IntGauge,
    /// Number of autoscaler configurations in the model
    pub autoscalers: IntGauge,
    /// Checkpoints written, total
    pub checkpoints_written: IntCounter,
    /// Aggregate/matching-pod bookkeeping disagreements observed
    pub model_inconsistencies: IntCounter,
    /// Admission outcomes by resource (`pod`/`autoscaler`/`unknown`) and
    /// status (`applied`/`skipped`/`error`/`denied`)
    pub admission_reviews: IntCounterVec,
    /// Pods evicted by the updater, total
    pub evictions: IntCounter,
    /// Evictions refused by the disruption admission check or the API
    pub evictions_refused: IntCounter,
}

impl Metrics {
    fn new() -> Self {
        Self {
            recommender_step_seconds: register_histogram_vec!(
                "rightsizer_recommender_step_seconds",
                "Duration of one recommender loop step",
                &["step"],
                STEP_BUCKETS.to_vec()
            )
            .expect("recommender_step_seconds registration"),
            aggregate_states: register_int_gauge!(
                "rightsizer_aggregate_container_states",
                "Aggregate container states currently tracked"
            )
            .expect("aggregate_states registration"),
            autoscalers: register_int_gauge!(
                "rightsizer_autoscalers",
                "Autoscaler configurations currently tracked"
            )
            .expect("autoscalers registration"),
            checkpoints_written: register_int_counter!(
                "rightsizer_checkpoints_written_total",
                "Checkpoints written to the API server"
            )
            .expect("checkpoints_written registration"),
            model_inconsistencies: register_int_counter!(
                "rightsizer_model_inconsistencies_total",
                "Observed disagreements between aggregates and matching pods"
            )
            .expect("model_inconsistencies registration"),
            admission_reviews: register_int_counter_vec!(
                "rightsizer_admission_reviews_total",
                "Admission review outcomes",
                &["resource", "status"]
            )
            .expect("admission_reviews registration"),
            evictions: register_int_counter!(
                "rightsizer_evictions_total",
                "Pods evicted so recommendations can apply"
            )
            .expect("evictions registration"),
            evictions_refused: register_int_counter!(
                "rightsizer_evictions_refused_total",
                "Evictions refused by disruption checks or the API server"
            )
            .expect("evictions_refused registration"),
        }
    }
}

/// The process-global metrics, registered on first access
pub fn metrics() -> &'static Metrics {
    GLOBAL_METRICS.get_or_init(Metrics::new)
}

/// Times one named loop step and records it on drop
pub struct StepTimer {
    step: &'static str,
    started: std::time::Instant,
}

impl StepTimer {
    /// Start timing the named step
    pub fn start(step: &'static str) -> Self {
        Self {
            step,
            started: std::time::Instant::now(),
        }
    }
}

impl Drop for StepTimer {
    fn drop(&mut self) {
        metrics()
            .recommender_step_seconds
            .with_label_values(&[self.step])
            .observe(self.started.elapsed().as_secs_f64());
    }
}

async fn serve_metrics_text() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

async fn healthz() -> &'static str {
    "ok"
}

/// Serve `/metrics` and `/healthz` on the given address for the lifetime of
/// the process
pub fn spawn_metrics_listener(addr: SocketAddr) {
    let router = Router::new()
        .route("/metrics", get(serve_metrics_text))
        .route("/healthz", get(healthz));
    tokio::spawn(async move {
        info!(%addr, "metrics listener starting");
        match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => {
                if let Err(e) = axum::serve(listener, router).await {
                    tracing::error!(error = %e, "metrics listener failed");
                }
            }
            Err(e) => tracing::error!(error = %e, %addr, "cannot bind metrics listener"),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_register_once_and_count() {
        let m = metrics();
        let before = m.evictions.get();
        m.evictions.inc();
        assert_eq!(m.evictions.get(), before + 1);

        m.admission_reviews
            .with_label_values(&["pod", "applied"])
            .inc();

        // Second access returns the same registry without panicking on
        // duplicate registration.
        let again = metrics();
        assert_eq!(again.evictions.get(), before + 1);
    }

    #[test]
    fn step_timer_records_on_drop() {
        {
            let _timer = StepTimer::start("test_step");
        }
        let families = prometheus::gather();
        let found = families
            .iter()
            .any(|f| f.get_name() == "rightsizer_recommender_step_seconds");
        assert!(found);
    }
}
