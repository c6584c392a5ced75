//! Prometheus metrics endpoint. Installs the recorder once at startup and
//! exposes it on the ambient axum router alongside `/_liveness`.

use axum::{routing::get, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub fn install_recorder() -> PrometheusHandle {
    const LATENCY_BUCKETS_MS: &[f64] = &[
        1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(LATENCY_BUCKETS_MS)
        .unwrap()
        .install_recorder()
        .unwrap()
}

/// Adds `/metrics` to a router, rendering whatever the process-global
/// recorder has accumulated. Should be mounted once, after other routes.
pub fn add_metrics_route(router: Router, handle: PrometheusHandle) -> Router {
    router.route("/metrics", get(move || std::future::ready(handle.render())))
}
