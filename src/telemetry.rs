use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber. `RUST_LOG` overrides the `info`
/// default.
pub fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.with_target(false).init();
    }
}

/// Serve Prometheus metrics on `addr` and register metric descriptions.
pub fn install_metrics_exporter(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    describe_metrics();
    tracing::info!(%addr, "Prometheus exporter listening");
    Ok(())
}

pub fn describe_metrics() {
    metrics::describe_counter!("ocr_jobs_completed_total", "Documents placed in Output");
    metrics::describe_counter!("ocr_jobs_failed_total", "Documents quarantined after exhausting retries");
    metrics::describe_counter!("ocr_jobs_retried_total", "Failed OCR attempts that were retried");
    metrics::describe_counter!("ocr_jobs_duplicate_total", "Inputs routed to Duplicate without processing");
    metrics::describe_counter!("ocr_lease_conflicts_total", "Cycles skipped because a lease was held");
    metrics::describe_histogram!(
        "ocr_job_duration_seconds",
        metrics::Unit::Seconds,
        "Wall time from first attempt to successful placement"
    );
    metrics::describe_gauge!("ocr_pending_files", "Input documents awaiting OCR at the last check");
}
