use axum::{routing::get, Router};
use metrics::describe_counter;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

use crate::error::{FeederError, Result};

static DESCRIBED: OnceCell<()> = OnceCell::new();

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Initialize the Prometheus recorder and register counter descriptions.
    pub fn init() -> Result<Self> {
        // Use default buckets to avoid API differences across crate versions.
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| FeederError::Backend(format!("prometheus: install recorder: {e}")))?;

        DESCRIBED.get_or_init(|| {
            describe_counter!("feeder_items_seen_total", "Items entering the pipeline");
            describe_counter!("feeder_items_emitted_total", "Items emitted per source");
            describe_counter!("feeder_item_failures_total", "Per-item conversion failures");
            describe_counter!("feeder_fetches_total", "Successful fetch cycles per source");
            describe_counter!("feeder_fetch_failures_total", "Failed fetch cycles per source");
            describe_counter!("feeder_events_evicted_total", "Events dropped from full buffers");
            describe_counter!("feeder_duplicates_total", "Items dropped by the dedup gate");
            describe_counter!("feeder_workflows_started_total", "Workflows dispatched downstream");
            describe_counter!("feeder_dispatch_failures_total", "Workflow submissions that failed");
        });

        Ok(Self { handle })
    }

    /// Returns a router exposing `/metrics` with the Prometheus exposition format.
    pub fn router(&self) -> Router {
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
