// src/metrics.rs
//! Prometheus exposition for the `firs_*` series recorded across the crate.

use axum::{http::StatusCode, routing::get, Router};
use metrics::gauge;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

use crate::storage::CoordinatorSettings;

// One global recorder per process; later `init` calls reuse it.
static HANDLE: OnceCell<Option<PrometheusHandle>> = OnceCell::new();

#[derive(Clone)]
pub struct Metrics {
    handle: Option<PrometheusHandle>,
}

impl Metrics {
    /// Install the Prometheus recorder (once) and publish the configured TTLs as gauges.
    ///
    /// If another recorder is already installed, `/metrics` answers 503 instead of panicking.
    pub fn init(settings: &CoordinatorSettings) -> Self {
        let handle = HANDLE
            .get_or_init(|| match PrometheusBuilder::new().install_recorder() {
                Ok(h) => Some(h),
                Err(e) => {
                    tracing::warn!(error = %e, "prometheus recorder not installed");
                    None
                }
            })
            .clone();

        gauge!("firs_cache_ttl_seconds").set(settings.cache_ttl.as_secs_f64());
        gauge!("firs_report_ttl_seconds").set(settings.report_ttl.as_secs_f64());
        gauge!("firs_ephemeral_ttl_seconds").set(settings.ephemeral_ttl.as_secs_f64());

        Self { handle }
    }

    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(|h| h.render())
    }

    /// Returns a router exposing `/metrics` with the Prometheus exposition format.
    pub fn router<S>(&self) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        let this = self.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let m = this.clone();
                async move {
                    match m.render() {
                        Some(body) => (StatusCode::OK, body),
                        None => (
                            StatusCode::SERVICE_UNAVAILABLE,
                            "metrics recorder unavailable".to_string(),
                        ),
                    }
                }
            }),
        )
    }
}
