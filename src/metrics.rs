use anyhow::{Context, Result};
use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

pub const WATCH_CHECKS_TOTAL: &str = "watch_checks_total";
pub const WATCH_CHECK_ERRORS_TOTAL: &str = "watch_check_errors_total";
pub const WATCH_CHANGES_TOTAL: &str = "watch_changes_total";
pub const FETCH_DURATION_MS: &str = "fetch_duration_ms";
pub const QUEUE_DEPTH: &str = "queue_depth";
pub const NOTIFICATIONS_SENT_TOTAL: &str = "notifications_sent_total";
pub const NOTIFICATIONS_FAILED_TOTAL: &str = "notifications_failed_total";
pub const PROXY_CHECK_LATENCY_MS: &str = "proxy_check_latency_ms";

/// One-time metrics registration (so series show up on /metrics).
pub fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(WATCH_CHECKS_TOTAL, "Completed watch checks.");
        describe_counter!(
            WATCH_CHECK_ERRORS_TOTAL,
            "Watch checks that ended in a fetch or processor error."
        );
        describe_counter!(WATCH_CHANGES_TOTAL, "Checks that produced an actionable change.");
        describe_histogram!(FETCH_DURATION_MS, "Fetch wall time in milliseconds.");
        describe_gauge!(QUEUE_DEPTH, "Jobs waiting in the queue.");
        describe_counter!(NOTIFICATIONS_SENT_TOTAL, "Notifications delivered.");
        describe_counter!(
            NOTIFICATIONS_FAILED_TOTAL,
            "Notifications that exhausted their retries."
        );
        describe_histogram!(PROXY_CHECK_LATENCY_MS, "Proxy probe latency in milliseconds.");
    });
}

/// Process-wide recorder; installing twice is an error in `metrics`, so the
/// handle is shared between the binary and in-process tests.
static HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

#[derive(Clone)]
pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Initialize (or reuse) the Prometheus recorder.
    pub fn init() -> Result<Self> {
        let handle = HANDLE
            .get_or_try_init(|| {
                PrometheusBuilder::new()
                    .install_recorder()
                    .context("prometheus: install recorder")
            })?
            .clone();
        ensure_metrics_described();
        Ok(Self { handle })
    }

    /// Returns a router exposing `/metrics` with the Prometheus exposition format.
    pub fn router<S>(&self) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }
}
